//! Embedded single-file backend.
//!
//! Values live in one table ("bucket") of a redb file. Each stored value is
//! prefixed with 8 little-endian bytes holding the process-wide write
//! counter at write time; that prefix is the pair's `last_index`. On open
//! the counter is raised to the largest prefix in the bucket, so indexes
//! keep increasing across restarts.
//!
//! The file is opened exclusively. Without `persist_connection` every
//! operation opens the file, waiting up to the connection timeout for
//! another handle to let go; with it the file stays open and a second
//! persistent open fails immediately with `AlreadyOpen`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redb::{Database, DatabaseError, ReadableTable, TableDefinition, TableError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::handle::Handle;
use crate::keys;
use crate::registry::Registry;
use crate::store::{Locker, Store, TreeWatchStream, WatchStream};
use crate::types::{Backend, Capabilities, KvPair, LockOptions, WriteOptions};

/// Width of the version prefix stored before every value.
pub const INDEX_PREFIX_LEN: usize = 8;

const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

static LAST_INDEX: AtomicU64 = AtomicU64::new(0);

fn next_index() -> u64 {
    LAST_INDEX.fetch_add(1, Ordering::SeqCst) + 1
}

fn observe_index(index: u64) {
    LAST_INDEX.fetch_max(index, Ordering::SeqCst);
}

/// Encodes a stored value: index prefix then payload.
pub fn encode_value(index: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(INDEX_PREFIX_LEN + value.len());
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(value);
    out
}

/// Splits a stored value into (index, payload).
pub fn decode_value(key: &str, raw: &[u8]) -> Result<(u64, Vec<u8>)> {
    if raw.len() < INDEX_PREFIX_LEN {
        return Err(StoreError::Corrupt(format!(
            "value for {} is {} bytes, shorter than the index prefix",
            key,
            raw.len()
        )));
    }
    let mut prefix = [0u8; INDEX_PREFIX_LEN];
    prefix.copy_from_slice(&raw[..INDEX_PREFIX_LEN]);
    Ok((u64::from_le_bytes(prefix), raw[INDEX_PREFIX_LEN..].to_vec()))
}

fn db_err(e: impl Into<redb::Error>) -> StoreError {
    match e.into() {
        redb::Error::Corrupted(msg) => StoreError::Corrupt(msg),
        redb::Error::Io(io) => StoreError::Io(io),
        other => StoreError::Backend(other.to_string()),
    }
}

fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Database::create(path).map_err(|e| match e {
        DatabaseError::DatabaseAlreadyOpen => StoreError::AlreadyOpen(path.to_path_buf()),
        other => db_err(other),
    })
}

/// Opens the file, polling until `timeout` while another handle holds it.
fn open_database_waiting(path: &Path, timeout: Duration) -> Result<Database> {
    let deadline = Instant::now() + timeout;
    loop {
        match open_database(path) {
            Err(StoreError::AlreadyOpen(_)) if Instant::now() < deadline => {
                std::thread::sleep(OPEN_RETRY_INTERVAL);
            }
            Err(StoreError::AlreadyOpen(path)) => {
                return Err(StoreError::Unreachable(format!(
                    "{} is locked by another handle",
                    path.display()
                )))
            }
            other => return other,
        }
    }
}

/// Creates the bucket if missing and returns the largest stored index.
fn prepare_bucket(db: &Database, bucket: &str) -> Result<u64> {
    let def: TableDefinition<&str, &[u8]> = TableDefinition::new(bucket);
    let txn = db.begin_write().map_err(db_err)?;
    let mut max_index = 0;
    {
        let table = txn.open_table(def).map_err(db_err)?;
        for item in table.iter().map_err(db_err)? {
            let (key, value) = item.map_err(db_err)?;
            let (index, _) = decode_value(key.value(), value.value())?;
            max_index = max_index.max(index);
        }
    }
    txn.commit().map_err(db_err)?;
    Ok(max_index)
}

/// Store handle over one bucket of an embedded database file.
pub struct EmbeddedStore {
    path: PathBuf,
    bucket: String,
    persist: bool,
    persistent: Mutex<Option<Arc<Database>>>,
    handle: Handle,
}

impl EmbeddedStore {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// Needs `config.bucket`. Seeds the write counter from the bucket.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bucket = config.require_bucket()?.to_string();
        let timeout = config.connection_timeout();

        let persistent = if config.persist_connection {
            let db = open_database(&path)?;
            observe_index(prepare_bucket(&db, &bucket)?);
            Some(Arc::new(db))
        } else {
            let db = open_database_waiting(&path, timeout)?;
            observe_index(prepare_bucket(&db, &bucket)?);
            None
        };

        info!(
            path = %path.display(),
            bucket = %bucket,
            persistent = config.persist_connection,
            "opened embedded store"
        );

        Ok(Self {
            path,
            bucket,
            persist: config.persist_connection,
            persistent: Mutex::new(persistent),
            handle: Handle::new(timeout),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `op` against the database on the blocking pool.
    async fn with_db<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &str) -> Result<T> + Send + 'static,
    {
        self.handle.check_open()?;
        let persistent = match self.persistent.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if self.persist && persistent.is_none() {
            return Err(StoreError::Closed);
        }
        let path = self.path.clone();
        let bucket = self.bucket.clone();
        let timeout = self.handle.timeout();

        let work = async move {
            tokio::task::spawn_blocking(move || match persistent {
                Some(db) => op(&db, &bucket),
                None => {
                    let db = open_database_waiting(&path, timeout)?;
                    op(&db, &bucket)
                }
            })
            .await
            .map_err(|e| StoreError::Backend(format!("blocking task failed: {}", e)))?
        };
        // Opening already waits up to the timeout; give the call itself the
        // same budget on top.
        self.handle.call_untimed(work).await
    }
}

/// Registers the embedded backend under `boltdb`.
pub fn register(registry: &Registry) {
    registry.register(Backend::BoltDb.as_str(), |endpoints, config| {
        let path = match endpoints.as_slice() {
            [path] => path.clone(),
            _ => {
                return Err(StoreError::Backend(format!(
                    "embedded backend takes exactly one file path, got {}",
                    endpoints.len()
                )))
            }
        };
        Ok(Arc::new(EmbeddedStore::open(path, &config)?) as Arc<dyn Store>)
    });
}

fn read_pair(db: &Database, bucket: &str, key: &str) -> Result<Option<KvPair>> {
    let def: TableDefinition<&str, &[u8]> = TableDefinition::new(bucket);
    let txn = db.begin_read().map_err(db_err)?;
    let table = match txn.open_table(def) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(db_err(e)),
    };
    match table.get(key).map_err(db_err)? {
        Some(raw) => {
            let (index, value) = decode_value(key, raw.value())?;
            Ok(Some(KvPair::new(key, value, index)))
        }
        None => Ok(None),
    }
}

fn unsupported(what: &str) -> StoreError {
    StoreError::NotSupported(format!("{} backend does not support {}", Backend::BoltDb, what))
}

fn scan_prefix(db: &Database, bucket: &str, prefix: &str) -> Result<Vec<KvPair>> {
    let def: TableDefinition<&str, &[u8]> = TableDefinition::new(bucket);
    let txn = db.begin_read().map_err(db_err)?;
    let table = match txn.open_table(def) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(db_err(e)),
    };
    let mut result = Vec::new();
    for item in table.range(prefix..).map_err(db_err)? {
        let (key, value) = item.map_err(db_err)?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        if !keys::has_prefix(key, prefix) {
            continue;
        }
        let (index, value) = decode_value(key, value.value())?;
        result.push(KvPair::new(key, value, index));
    }
    Ok(result)
}

#[async_trait]
impl Store for EmbeddedStore {
    fn backend(&self) -> Backend {
        Backend::BoltDb
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    async fn get(&self, key: &str) -> Result<KvPair> {
        let key = keys::normalize_leaf(key)?;
        let lookup = key.clone();
        self.with_db(move |db, bucket| read_pair(db, bucket, &lookup))
            .await?
            .ok_or(StoreError::NotFound { key })
    }

    async fn put(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<()> {
        if options.ephemeral_ttl().is_some() {
            return Err(unsupported("ttl"));
        }
        let key = keys::normalize_leaf(key)?;
        let value = value.to_vec();
        self.with_db(move |db, bucket| {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(bucket);
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(def).map_err(db_err)?;
                let stored = encode_value(next_index(), &value);
                table.insert(key.as_str(), stored.as_slice()).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = keys::normalize_leaf(key)?;
        self.with_db(move |db, bucket| {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(bucket);
            let txn = db.begin_write().map_err(db_err)?;
            let removed = {
                let mut table = txn.open_table(def).map_err(db_err)?;
                let old = table.remove(key.as_str()).map_err(db_err)?;
                old.is_some()
            };
            if !removed {
                txn.abort().map_err(db_err)?;
                return Err(StoreError::NotFound { key });
            }
            txn.commit().map_err(db_err)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = keys::normalize_leaf(key)?;
        self.with_db(move |db, bucket| Ok(read_pair(db, bucket, &key)?.is_some()))
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let prefix = keys::normalize(prefix)?;
        let scan = prefix.clone();
        let pairs = self
            .with_db(move |db, bucket| scan_prefix(db, bucket, &scan))
            .await?;
        if pairs.is_empty() {
            return Err(StoreError::NotFound { key: prefix });
        }
        Ok(pairs)
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let prefix = keys::normalize(prefix)?;
        self.with_db(move |db, bucket| {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(bucket);
            let txn = db.begin_write().map_err(db_err)?;
            let removed = {
                let mut table = txn.open_table(def).map_err(db_err)?;
                let mut doomed = Vec::new();
                for item in table.range(prefix.as_str()..).map_err(db_err)? {
                    let (key, _) = item.map_err(db_err)?;
                    let key = key.value();
                    if !key.starts_with(prefix.as_str()) {
                        break;
                    }
                    if keys::has_prefix(key, &prefix) {
                        doomed.push(key.to_string());
                    }
                }
                for key in &doomed {
                    table.remove(key.as_str()).map_err(db_err)?;
                }
                doomed.len()
            };
            txn.commit().map_err(db_err)?;
            debug!(prefix = %prefix, removed, "deleted tree");
            Ok(())
        })
        .await
    }

    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
        options: &WriteOptions,
    ) -> Result<KvPair> {
        if options.ephemeral_ttl().is_some() {
            return Err(unsupported("ttl"));
        }
        let key = keys::normalize_leaf(key)?;
        let value = value.to_vec();
        let expected = previous.map(|p| p.last_index);
        self.with_db(move |db, bucket| {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(bucket);
            let txn = db.begin_write().map_err(db_err)?;
            let outcome = {
                let mut table = txn.open_table(def).map_err(db_err)?;
                let current = match table.get(key.as_str()).map_err(db_err)? {
                    Some(raw) => Some(decode_value(&key, raw.value())?.0),
                    None => None,
                };
                match (expected, current) {
                    (None, Some(_)) => Err(StoreError::KeyExists { key: key.clone() }),
                    (Some(_), None) => Err(StoreError::NotFound { key: key.clone() }),
                    (Some(want), Some(have)) if want != have => {
                        Err(StoreError::KeyModified { key: key.clone() })
                    }
                    _ => {
                        let index = next_index();
                        let stored = encode_value(index, &value);
                        table.insert(key.as_str(), stored.as_slice()).map_err(db_err)?;
                        Ok(index)
                    }
                }
            };
            match outcome {
                Ok(index) => {
                    txn.commit().map_err(db_err)?;
                    Ok(KvPair::new(key, value, index))
                }
                Err(e) => {
                    txn.abort().map_err(db_err)?;
                    Err(e)
                }
            }
        })
        .await
    }

    async fn atomic_delete(&self, key: &str, previous: Option<&KvPair>) -> Result<()> {
        let previous = previous.ok_or(StoreError::PreviousNotSpecified)?;
        let key = keys::normalize_leaf(key)?;
        let expected = previous.last_index;
        self.with_db(move |db, bucket| {
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(bucket);
            let txn = db.begin_write().map_err(db_err)?;
            let outcome = {
                let mut table = txn.open_table(def).map_err(db_err)?;
                let current = match table.get(key.as_str()).map_err(db_err)? {
                    Some(raw) => Some(decode_value(&key, raw.value())?.0),
                    None => None,
                };
                match current {
                    None => Err(StoreError::NotFound { key: key.clone() }),
                    Some(have) if have != expected => {
                        Err(StoreError::KeyModified { key: key.clone() })
                    }
                    Some(_) => {
                        table.remove(key.as_str()).map_err(db_err)?;
                        Ok(())
                    }
                }
            };
            match outcome {
                Ok(()) => txn.commit().map_err(db_err),
                Err(e) => {
                    txn.abort().map_err(db_err)?;
                    Err(e)
                }
            }
        })
        .await
    }

    async fn watch(&self, _key: &str, _cancel: CancellationToken) -> Result<WatchStream> {
        Err(unsupported("watch"))
    }

    async fn watch_tree(
        &self,
        _prefix: &str,
        _cancel: CancellationToken,
    ) -> Result<TreeWatchStream> {
        Err(unsupported("watch"))
    }

    async fn new_lock(&self, _key: &str, _options: LockOptions) -> Result<Box<dyn Locker>> {
        Err(unsupported("lock"))
    }

    async fn close(&self) {
        self.handle.close().await;
        if let Ok(mut guard) = self.persistent.lock() {
            if guard.take().is_some() {
                debug!(path = %self.path.display(), "released embedded database");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> StoreConfig {
        StoreConfig::default()
            .with_bucket("swarm")
            .with_timeout(Duration::from_millis(300))
    }

    #[test]
    fn test_value_encoding() {
        let raw = encode_value(42, b"hello");
        assert_eq!(raw.len(), INDEX_PREFIX_LEN + 5);
        assert_eq!(&raw[..8], &42u64.to_le_bytes());
        let (index, value) = decode_value("k", &raw).unwrap();
        assert_eq!(index, 42);
        assert_eq!(value, b"hello");
        assert!(matches!(
            decode_value("k", &[1, 2, 3]),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_missing_bucket_rejected() {
        let dir = tempdir().unwrap();
        let res = EmbeddedStore::open(dir.path().join("kv.db"), &StoreConfig::default());
        assert!(matches!(res, Err(StoreError::MissingOption("bucket"))));
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("kv.db"), &config()).unwrap();
        store.put("a", b"1", &WriteOptions::default()).await.unwrap();
        let pair = store.get("/a/").await.unwrap();
        assert_eq!(pair.key, "a");
        assert_eq!(pair.value, b"1");
        assert!(pair.last_index > 0);

        store.delete("a").await.unwrap();
        assert!(matches!(
            store.get("a").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete("a").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_value() {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("kv.db"), &config()).unwrap();
        store.put("empty", b"", &WriteOptions::default()).await.unwrap();
        assert!(store.get("empty").await.unwrap().value.is_empty());
    }

    #[tokio::test]
    async fn test_index_strictly_increases() {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("kv.db"), &config()).unwrap();
        let mut last = 0;
        for i in 0..5 {
            store
                .put("k", format!("{}", i).as_bytes(), &WriteOptions::default())
                .await
                .unwrap();
            let pair = store.get("k").await.unwrap();
            assert!(pair.last_index > last);
            last = pair.last_index;
        }
    }

    #[tokio::test]
    async fn test_list_respects_segment_boundary() {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("kv.db"), &config()).unwrap();
        let opts = WriteOptions::default();
        store.put("foo/a", b"1", &opts).await.unwrap();
        store.put("foo/b", b"2", &opts).await.unwrap();
        store.put("foobar", b"3", &opts).await.unwrap();

        let pairs = store.list("foo").await.unwrap();
        let keys: Vec<_> = pairs.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["foo/a", "foo/b"]);

        store.delete_tree("foo").await.unwrap();
        assert!(matches!(
            store.list("foo").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.exists("foobar").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_tree_in_one_write() {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("kv.db"), &config()).unwrap();
        // No table yet: nothing to remove.
        store.delete_tree("svc").await.unwrap();

        let opts = WriteOptions::default();
        for key in ["svc/a", "svc/b/c", "svc/b/d", "svc0", "svd/a"] {
            store.put(key, b"v", &opts).await.unwrap();
        }
        store.delete_tree("svc").await.unwrap();
        for key in ["svc/a", "svc/b/c", "svc/b/d"] {
            assert!(!store.exists(key).await.unwrap(), "{}", key);
        }
        assert!(store.exists("svc0").await.unwrap());
        assert!(store.exists("svd/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_atomic_put_and_delete() {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("kv.db"), &config()).unwrap();
        let opts = WriteOptions::default();

        let created = store.atomic_put("a", b"1", None, &opts).await.unwrap();
        assert!(matches!(
            store.atomic_put("a", b"x", None, &opts).await,
            Err(StoreError::KeyExists { .. })
        ));

        let updated = store
            .atomic_put("a", b"2", Some(&created), &opts)
            .await
            .unwrap();
        assert!(updated.last_index > created.last_index);
        assert!(matches!(
            store.atomic_put("a", b"3", Some(&created), &opts).await,
            Err(StoreError::KeyModified { .. })
        ));

        assert!(matches!(
            store.atomic_delete("a", None).await,
            Err(StoreError::PreviousNotSpecified)
        ));
        assert!(matches!(
            store.atomic_delete("a", Some(&created)).await,
            Err(StoreError::KeyModified { .. })
        ));
        store.atomic_delete("a", Some(&updated)).await.unwrap();
        assert!(!store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_unsupported_capabilities() {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("kv.db"), &config()).unwrap();
        assert!(matches!(
            store
                .put("k", b"v", &WriteOptions::with_ttl(Duration::from_secs(1)))
                .await,
            Err(StoreError::NotSupported(_))
        ));
        assert!(matches!(
            store.watch("k", CancellationToken::new()).await,
            Err(StoreError::NotSupported(_))
        ));
        assert!(matches!(
            store.new_lock("k", LockOptions::default()).await,
            Err(StoreError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_counter_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.db");
        let before = {
            let store = EmbeddedStore::open(&path, &config()).unwrap();
            store.put("a", b"1", &WriteOptions::default()).await.unwrap();
            let pair = store.get("a").await.unwrap();
            store.close().await;
            pair
        };

        let store = EmbeddedStore::open(&path, &config()).unwrap();
        assert_eq!(store.get("a").await.unwrap(), before);
        store.put("b", b"2", &WriteOptions::default()).await.unwrap();
        assert!(store.get("b").await.unwrap().last_index > before.last_index);
    }

    #[tokio::test]
    async fn test_persistent_handle_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.db");
        let mut persistent = config();
        persistent.persist_connection = true;

        let first = EmbeddedStore::open(&path, &persistent).unwrap();
        assert!(matches!(
            EmbeddedStore::open(&path, &persistent),
            Err(StoreError::AlreadyOpen(_))
        ));
        assert!(matches!(
            EmbeddedStore::open(&path, &config()),
            Err(StoreError::Unreachable(_))
        ));

        first.close().await;
        assert!(matches!(first.get("a").await, Err(StoreError::Closed)));

        // The file is free again once the persistent handle is closed.
        let second = EmbeddedStore::open(&path, &persistent).unwrap();
        second.close().await;
    }
}
