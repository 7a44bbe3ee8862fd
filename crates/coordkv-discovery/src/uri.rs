//! Discovery URIs.
//!
//! `etcd://h1:2379,h2:2379/swarm`, `consul://h:8500/swarm` and
//! `zk://a:2181,b:2181/swarm` store entries under `swarm/discovery`.
//! `file:///var/lib/swarm.db` keeps them in an embedded database.
//! `nodes://a:2375,b:2375` (or the bare list) is a fixed member list and
//! `token://<id>` uses the hosted discovery service.

use coordkv_store::{keys, Backend, StoreUri};

use crate::error::{DiscoveryError, Result};

/// Subtree under the URI path where members register.
pub const DISCOVERY_DIR: &str = "discovery";

/// Bucket the embedded backend uses when the config names none.
pub const DEFAULT_BUCKET: &str = "discovery";

/// What a discovery URI points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryTarget {
    /// A registered store backend.
    Store {
        /// Registry tag.
        tag: String,
        /// Addresses handed to the constructor.
        addresses: Vec<String>,
        /// Key prefix members register under.
        prefix: String,
    },
    /// Fixed member list, ranges not yet expanded.
    Nodes(Vec<String>),
    /// Hosted discovery cluster id.
    Token(String),
}

/// Parses a discovery URI.
pub fn parse(uri: &str) -> Result<DiscoveryTarget> {
    let parsed = StoreUri::parse(uri).map_err(|e| DiscoveryError::invalid_uri(uri, e.to_string()))?;
    match parsed.scheme.as_str() {
        "nodes" => {
            if parsed.endpoints.is_empty() {
                return Err(DiscoveryError::invalid_uri(uri, "no nodes listed"));
            }
            Ok(DiscoveryTarget::Nodes(parsed.endpoints))
        }
        "token" => {
            let token = parsed
                .endpoints
                .first()
                .cloned()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| DiscoveryError::invalid_uri(uri, "missing token"))?;
            Ok(DiscoveryTarget::Token(token))
        }
        // The path names the database file, so entries sit at the root.
        "file" | "boltdb" => {
            if parsed.path.is_empty() {
                return Err(DiscoveryError::invalid_uri(uri, "missing file path"));
            }
            Ok(DiscoveryTarget::Store {
                tag: Backend::BoltDb.as_str().to_string(),
                addresses: vec![parsed.file_path()],
                prefix: DISCOVERY_DIR.to_string(),
            })
        }
        _ => {
            if parsed.endpoints.is_empty() {
                return Err(DiscoveryError::invalid_uri(uri, "no endpoints"));
            }
            Ok(DiscoveryTarget::Store {
                prefix: keys::join(&parsed.path, DISCOVERY_DIR),
                tag: parsed.scheme,
                addresses: parsed.endpoints,
            })
        }
    }
}
