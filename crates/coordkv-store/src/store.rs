//! The uniform store contract.
//!
//! Every backend implements [`Store`]. Operations block the calling task
//! until the backend answers; concurrency comes from running several tasks
//! against one shared handle (`Arc<dyn Store>`).

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError};
use crate::types::{Backend, Capabilities, KvPair, LockOptions, WriteOptions};

/// Stream of values for one key. The first item is the value at
/// subscription time. The stream ends when the watch is cancelled, the key
/// is deleted, or the handle is lost.
pub type WatchStream = mpsc::Receiver<KvPair>;

/// Stream of full child lists under a prefix. The first item is the list
/// at subscription time.
pub type TreeWatchStream = mpsc::Receiver<Vec<KvPair>>;

/// Key/value coordination store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend family of this handle.
    fn backend(&self) -> Backend;

    /// Optional features of this backend.
    fn capabilities(&self) -> Capabilities;

    /// Reads a key.
    async fn get(&self, key: &str) -> Result<KvPair>;

    /// Writes a key unconditionally, creating missing parents.
    async fn put(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<()>;

    /// Deletes a single key. Missing keys report `NotFound`.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Reports whether a key exists. Eventually consistent across reads.
    async fn exists(&self, key: &str) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lists every leaf under `prefix`, including `prefix` itself if it is
    /// a leaf.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Deletes `prefix` and all descendants.
    async fn delete_tree(&self, prefix: &str) -> Result<()>;

    /// Compare-and-swap write.
    ///
    /// With `previous == None` the write succeeds only if the key is absent
    /// (`KeyExists` otherwise). With a previous pair it succeeds only if
    /// the key still carries `previous.last_index` (`KeyModified`
    /// otherwise). Returns the stored pair.
    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
        options: &WriteOptions,
    ) -> Result<KvPair>;

    /// Compare-and-delete. `previous` is mandatory.
    async fn atomic_delete(&self, key: &str, previous: Option<&KvPair>) -> Result<()>;

    /// Watches one key. Returns `NotFound` if the key is absent.
    async fn watch(&self, key: &str, cancel: CancellationToken) -> Result<WatchStream>;

    /// Watches every child under a prefix. Each item is a full snapshot.
    ///
    /// etcd and Consul snapshots hold every leaf below the prefix. ZooKeeper
    /// watches only the direct children: a snapshot lists those children,
    /// and writes to deeper nodes do not trigger one. Callers that need
    /// nested keys on ZooKeeper should `list` after each snapshot.
    async fn watch_tree(&self, prefix: &str, cancel: CancellationToken)
        -> Result<TreeWatchStream>;

    /// Builds a lock on `key`. The lock is not acquired yet.
    async fn new_lock(&self, key: &str, options: LockOptions) -> Result<Box<dyn Locker>>;

    /// Releases connections and ends background sessions. Later calls
    /// return `Closed`.
    async fn close(&self);
}

/// A distributed mutex.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Blocks until the lock is held or `cancel` fires.
    ///
    /// The returned token is cancelled exactly once, when the lock is lost
    /// for any reason: release, session loss, ttl expiry or external
    /// deletion.
    async fn acquire(&self, cancel: CancellationToken) -> Result<CancellationToken>;

    /// Stops renewal and deletes the lock key if it is still ours.
    async fn release(&self) -> Result<()>;
}
