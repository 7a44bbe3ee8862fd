//! Data types shared by every backend.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError};

/// A key, its value and the backend's version token for it.
///
/// Pairs are snapshots: later reads produce new pairs. `last_index` is never
/// zero for a pair returned by a successful operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    /// Normalized key (no leading or trailing slash).
    pub key: String,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Monotonic version token, passed back unchanged to atomic operations.
    pub last_index: u64,
}

impl KvPair {
    /// Creates a pair.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, last_index: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            last_index,
        }
    }

    /// Value as UTF-8 text, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

impl fmt::Display for KvPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={} @{}",
            self.key,
            String::from_utf8_lossy(&self.value),
            self.last_index
        )
    }
}

/// Options for `put` and `atomic_put`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Requests an ephemeral key tied to the handle's session.
    pub ttl: Option<Duration>,
    /// Directory hint; ignored by backends without directories.
    pub is_directory: bool,
}

impl WriteOptions {
    /// Options for an ephemeral write.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            is_directory: false,
        }
    }

    /// Options for a directory write.
    pub fn directory() -> Self {
        Self {
            ttl: None,
            is_directory: true,
        }
    }

    /// The ttl if one was requested and it is nonzero.
    pub fn ephemeral_ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }
}

/// Options for `new_lock`.
#[derive(Clone, Debug, Default)]
pub struct LockOptions {
    /// Written into the lock's backing key.
    pub value: Option<Vec<u8>>,
    /// How long the lock stays held after the owner stops renewing.
    pub ttl: Option<Duration>,
    /// Cancelling this token stops background renewal.
    pub renew_signal: Option<CancellationToken>,
}

impl LockOptions {
    /// Lock options with a ttl and no value.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    /// Sets the value stored in the lock key.
    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Sets the renewal stop signal.
    pub fn renew_signal(mut self, signal: CancellationToken) -> Self {
        self.renew_signal = Some(signal);
        self
    }
}

/// Backend families known to this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Embedded single-file store.
    BoltDb,
    /// Leader-replicated HTTP/JSON store.
    Etcd,
    /// Session/gossip store.
    Consul,
    /// Hierarchical store with one-shot watches.
    Zookeeper,
}

impl Backend {
    /// Registry tag for the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::BoltDb => "boltdb",
            Backend::Etcd => "etcd",
            Backend::Consul => "consul",
            Backend::Zookeeper => "zk",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional features a backend may provide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// `watch` and `watch_tree` are available.
    pub supports_watch: bool,
    /// `new_lock` is available.
    pub supports_lock: bool,
    /// Ephemeral writes are available.
    pub supports_ttl: bool,
}

impl Capabilities {
    /// Everything supported.
    pub const ALL: Capabilities = Capabilities {
        supports_watch: true,
        supports_lock: true,
        supports_ttl: true,
    };

    /// Nothing optional supported.
    pub const NONE: Capabilities = Capabilities {
        supports_watch: false,
        supports_lock: false,
        supports_ttl: false,
    };

    /// Fails with `NotSupported` unless watches are available.
    pub fn require_watch(&self, backend: Backend) -> Result<()> {
        require(self.supports_watch, backend, "watch")
    }

    /// Fails with `NotSupported` unless locks are available.
    pub fn require_lock(&self, backend: Backend) -> Result<()> {
        require(self.supports_lock, backend, "lock")
    }

    /// Fails with `NotSupported` unless ephemeral keys are available.
    pub fn require_ttl(&self, backend: Backend) -> Result<()> {
        require(self.supports_ttl, backend, "ttl")
    }
}

fn require(supported: bool, backend: Backend, what: &str) -> Result<()> {
    if supported {
        Ok(())
    } else {
        Err(StoreError::NotSupported(format!(
            "{} backend does not support {}",
            backend, what
        )))
    }
}
