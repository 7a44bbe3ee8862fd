//! Backend registry and URI dispatch.
//!
//! A [`Registry`] maps a backend tag (the URI scheme) to a constructor. The
//! process default registry is created on first use with the embedded,
//! etcd and consul constructors; zookeeper needs a connector and is added
//! with [`crate::backends::zookeeper::register`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::backends;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::store::Store;

/// Scheme assumed when a URI has none: a static node list.
pub const STATIC_SCHEME: &str = "nodes";

/// Builds a store handle from an endpoint list and a config.
pub type Constructor =
    Arc<dyn Fn(Vec<String>, StoreConfig) -> Result<Arc<dyn Store>> + Send + Sync>;

/// A parsed `scheme://host:port,host:port/path` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUri {
    /// Lowercased scheme, `nodes` when the URI had none.
    pub scheme: String,
    /// Comma-separated authorities, in order.
    pub endpoints: Vec<String>,
    /// Path after the authority, without leading or trailing `/`.
    pub path: String,
}

impl StoreUri {
    /// Parses a URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason| StoreError::InvalidUri {
            uri: uri.to_string(),
            reason,
        };

        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty uri"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                if scheme.is_empty() {
                    return Err(invalid("empty scheme"));
                }
                if !scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
                {
                    return Err(invalid("scheme has invalid characters"));
                }
                (scheme.to_ascii_lowercase(), rest)
            }
            None => (STATIC_SCHEME.to_string(), trimmed),
        };

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        let endpoints: Vec<String> = authority
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let path = path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");

        if endpoints.is_empty() && path.is_empty() {
            return Err(invalid("no endpoints or path"));
        }

        Ok(Self {
            scheme,
            endpoints,
            path,
        })
    }

    /// Absolute file path for `scheme:///path` URIs.
    pub fn file_path(&self) -> String {
        format!("/{}", self.path)
    }

    /// Addresses handed to a constructor: the endpoints, or the absolute
    /// path when the authority is empty.
    pub fn addresses(&self) -> Vec<String> {
        if self.endpoints.is_empty() {
            vec![self.file_path()]
        } else {
            self.endpoints.clone()
        }
    }
}

impl fmt::Display for StoreUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.endpoints.join(","))?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

/// Tag to constructor table.
#[derive(Default)]
pub struct Registry {
    constructors: Mutex<BTreeMap<String, Constructor>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the embedded, etcd and consul backends.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        backends::boltdb::register(&registry);
        backends::etcd::register(&registry);
        backends::consul::register(&registry);
        registry
    }

    /// Registers `constructor` under `tag`, replacing any earlier one.
    pub fn register<F>(&self, tag: &str, constructor: F)
    where
        F: Fn(Vec<String>, StoreConfig) -> Result<Arc<dyn Store>> + Send + Sync + 'static,
    {
        let tag = tag.to_ascii_lowercase();
        let mut table = match self.constructors.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        if table.insert(tag.clone(), Arc::new(constructor)).is_some() {
            debug!(tag = %tag, "replaced registered backend");
        }
    }

    /// Registered tags, alphabetically.
    pub fn tags(&self) -> Vec<String> {
        match self.constructors.lock() {
            Ok(table) => table.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }

    /// True if `tag` has a constructor.
    pub fn contains(&self, tag: &str) -> bool {
        self.lookup(tag).is_some()
    }

    fn lookup(&self, tag: &str) -> Option<Constructor> {
        let tag = tag.to_ascii_lowercase();
        match self.constructors.lock() {
            Ok(table) => table.get(&tag).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&tag).cloned(),
        }
    }

    /// Builds a store for `tag`.
    pub fn new_store(
        &self,
        tag: &str,
        endpoints: Vec<String>,
        config: StoreConfig,
    ) -> Result<Arc<dyn Store>> {
        let constructor = self.lookup(tag).ok_or_else(|| {
            StoreError::NotSupported(format!(
                "unknown backend '{}', registered: {}",
                tag,
                self.tags().join(", ")
            ))
        })?;
        // Run outside the table lock so constructors may consult the registry.
        constructor(endpoints, config)
    }

    /// Parses `uri` and builds the store it names.
    pub fn open(&self, uri: &str, config: StoreConfig) -> Result<(Arc<dyn Store>, StoreUri)> {
        let parsed = StoreUri::parse(uri)?;
        let store = self.new_store(&parsed.scheme, parsed.addresses(), config)?;
        debug!(uri = %parsed, backend = %store.backend(), "opened store");
        Ok((store, parsed))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tags", &self.tags())
            .finish()
    }
}

/// Process-wide registry, created with [`Registry::with_defaults`] on first
/// use.
pub fn default_registry() -> &'static Registry {
    static DEFAULT: OnceLock<Registry> = OnceLock::new();
    DEFAULT.get_or_init(Registry::with_defaults)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::boltdb::EmbeddedStore;
    use tempfile::tempdir;

    #[test]
    fn test_parse_full_uri() {
        let uri = StoreUri::parse("zk://a:2181,b:2181/swarm").unwrap();
        assert_eq!(uri.scheme, "zk");
        assert_eq!(uri.endpoints, vec!["a:2181", "b:2181"]);
        assert_eq!(uri.path, "swarm");
        assert_eq!(uri.to_string(), "zk://a:2181,b:2181/swarm");
    }

    #[test]
    fn test_parse_without_scheme() {
        let uri = StoreUri::parse("10.0.0.1:2375,10.0.0.2:2375").unwrap();
        assert_eq!(uri.scheme, STATIC_SCHEME);
        assert_eq!(uri.endpoints.len(), 2);
        assert!(uri.path.is_empty());
    }

    #[test]
    fn test_parse_file_uri() {
        let uri = StoreUri::parse("boltdb:///var/lib/swarm.db").unwrap();
        assert!(uri.endpoints.is_empty());
        assert_eq!(uri.file_path(), "/var/lib/swarm.db");
        assert_eq!(uri.addresses(), vec!["/var/lib/swarm.db"]);
    }

    #[test]
    fn test_parse_nested_path() {
        let uri = StoreUri::parse("ETCD://h:4001//my//path/").unwrap();
        assert_eq!(uri.scheme, "etcd");
        assert_eq!(uri.path, "my/path");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StoreUri::parse("").is_err());
        assert!(StoreUri::parse("://host").is_err());
        assert!(StoreUri::parse("etcd://").is_err());
    }

    #[test]
    fn test_unknown_scheme_lists_tags() {
        let registry = Registry::with_defaults();
        let err = registry
            .open("redis://h:6379", StoreConfig::default())
            .err()
            .unwrap();
        match err {
            StoreError::NotSupported(msg) => {
                assert!(msg.contains("boltdb, consul, etcd"), "{}", msg)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_register_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.db");
        let registry = Registry::new();
        registry.register("mock", |_, _| {
            Err(StoreError::Backend("first".into()))
        });
        let db_path = path.clone();
        registry.register("MOCK", move |_, config| {
            let store = EmbeddedStore::open(&db_path, &config.with_bucket("b"))?;
            Ok(Arc::new(store) as Arc<dyn Store>)
        });
        assert_eq!(registry.tags(), vec!["mock"]);
        assert!(registry.new_store("mock", vec![], StoreConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_open_embedded_via_uri() {
        let dir = tempdir().unwrap();
        let uri = format!("boltdb://{}", dir.path().join("kv.db").display());
        let (store, parsed) = default_registry()
            .open(&uri, StoreConfig::default().with_bucket("swarm"))
            .unwrap();
        assert_eq!(parsed.scheme, "boltdb");
        assert_eq!(store.backend(), crate::types::Backend::BoltDb);
        store
            .put("x", b"1", &crate::types::WriteOptions::default())
            .await
            .unwrap();
        store.close().await;
    }
}
