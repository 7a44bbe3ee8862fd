//! Cluster endpoints, range expansion and membership diffs.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};

/// One registered node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address, without IPv6 brackets.
    pub host: String,
    /// Port, kept as given.
    pub port: String,
}

impl Endpoint {
    /// Creates an endpoint from its parts.
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    /// Parses `host:port` or `[v6addr]:port`.
    pub fn parse(entry: &str) -> Result<Self> {
        let invalid = |reason| DiscoveryError::InvalidEndpoint {
            entry: entry.to_string(),
            reason,
        };
        let trimmed = entry.trim();
        let (host, port) = match trimmed.strip_prefix('[') {
            Some(rest) => rest
                .split_once("]:")
                .ok_or_else(|| invalid("unterminated ipv6 address or missing port"))?,
            None => trimmed
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?,
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("port is not a number"));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Expands one numeric range: `10.0.0.[1:3]:2375` yields
/// `10.0.0.1:2375`, `10.0.0.2:2375` and `10.0.0.3:2375`. Patterns without
/// a range come back unchanged.
pub fn expand_range(pattern: &str) -> Result<Vec<String>> {
    let invalid = |reason| DiscoveryError::InvalidEndpoint {
        entry: pattern.to_string(),
        reason,
    };
    let Some(open) = pattern.find('[') else {
        return Ok(vec![pattern.to_string()]);
    };
    let Some(close) = pattern[open..].find(']').map(|i| open + i) else {
        return Err(invalid("unterminated range"));
    };
    let inner = &pattern[open + 1..close];
    let Some((lo, hi)) = inner.split_once(':') else {
        return Ok(vec![pattern.to_string()]);
    };
    let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) else {
        // Not numeric, e.g. an IPv6 literal.
        return Ok(vec![pattern.to_string()]);
    };
    if lo > hi {
        return Err(invalid("range start exceeds end"));
    }
    let (head, tail) = (&pattern[..open], &pattern[close + 1..]);
    Ok((lo..=hi).map(|n| format!("{}{}{}", head, n, tail)).collect())
}

/// Parses a list of entries, expanding ranges.
pub fn parse_entries<S: AsRef<str>>(entries: &[S]) -> Result<Vec<Endpoint>> {
    let mut out = Vec::new();
    for entry in entries {
        for expanded in expand_range(entry.as_ref())? {
            out.push(Endpoint::parse(&expanded)?);
        }
    }
    Ok(out)
}

/// Members that appeared and disappeared between two views.
///
/// Returns `(added, removed)`, each in the order of the view it came from.
pub fn diff(previous: &[Endpoint], current: &[Endpoint]) -> (Vec<Endpoint>, Vec<Endpoint>) {
    let before: HashSet<&Endpoint> = previous.iter().collect();
    let after: HashSet<&Endpoint> = current.iter().collect();
    let added = current
        .iter()
        .filter(|e| !before.contains(e))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|e| !after.contains(e))
        .cloned()
        .collect();
    (added, removed)
}

/// True if both views hold the same members, ignoring order.
pub fn same_members(a: &[Endpoint], b: &[Endpoint]) -> bool {
    let a: HashSet<&Endpoint> = a.iter().collect();
    let b: HashSet<&Endpoint> = b.iter().collect();
    a == b
}
