//! Session-based backend (Consul KV).
//!
//! `last_index` is the key's `ModifyIndex`. Ephemeral keys are acquired
//! with the handle's shared session (behavior `delete`), so they disappear
//! when the session is destroyed on close or expires after a crash. Consul
//! has no directories: `is_directory` is ignored and prefixes are plain key
//! prefixes filtered to whole path segments.

pub mod client;
pub mod http;
pub mod lock;
pub mod session;
pub mod sim;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use self::client::{BlockingQuery, ConsulClient, ConsulError, ConsulPair, KvWrite};
use self::http::HttpConsulClient;
use self::session::SessionManager;
use crate::config::{StoreConfig, OPT_MIN_TTL, OPT_SESSION_TTL, OPT_WATCH_WAIT};
use crate::error::{Result, StoreError};
use crate::handle::Handle;
use crate::keys;
use crate::registry::Registry;
use crate::store::{Locker, Store, TreeWatchStream, WatchStream};
use crate::types::{Backend, Capabilities, KvPair, LockOptions, WriteOptions};
use crate::watch::{spawn_watch, WatchSource};

/// Blocking-query wait when `watch_wait` is not configured.
pub const DEFAULT_WATCH_WAIT: Duration = Duration::from_secs(30);
/// Smallest session ttl Consul accepts.
pub const DEFAULT_MIN_TTL: Duration = Duration::from_secs(10);

/// Maps a Consul error for `key` to the contract's kinds.
pub fn map_error(key: &str, e: ConsulError) -> StoreError {
    match e {
        ConsulError::Unavailable(msg) => StoreError::Unreachable(msg),
        ConsulError::InvalidSession(msg) => {
            StoreError::Unreachable(format!("{} (key {})", msg, key))
        }
        other => StoreError::Backend(format!("{} (key {})", other, key)),
    }
}

fn pair_of(pair: ConsulPair) -> KvPair {
    KvPair::new(pair.key, pair.value, pair.modify_index)
}

/// Settings shared by the store and its lockers.
#[derive(Debug, Clone)]
pub(crate) struct ConsulSettings {
    pub(crate) watch_wait: Duration,
}

/// Consul-backed store handle.
pub struct ConsulStore {
    client: Arc<dyn ConsulClient>,
    handle: Arc<Handle>,
    sessions: Arc<SessionManager>,
    settings: ConsulSettings,
}

impl ConsulStore {
    /// Wraps a native client.
    pub fn new(client: Arc<dyn ConsulClient>, config: &StoreConfig) -> Result<Self> {
        let handle = Arc::new(Handle::new(config.connection_timeout()));
        let min_ttl = config
            .duration_option(OPT_MIN_TTL)?
            .unwrap_or(DEFAULT_MIN_TTL);
        let session_ttl = config.duration_option(OPT_SESSION_TTL)?;
        let sessions = SessionManager::new(client.clone(), handle.clone(), min_ttl, session_ttl);
        Ok(Self {
            client,
            handle,
            sessions: Arc::new(sessions),
            settings: ConsulSettings {
                watch_wait: config
                    .duration_option(OPT_WATCH_WAIT)?
                    .unwrap_or(DEFAULT_WATCH_WAIT),
            },
        })
    }

    /// Connects to Consul agents over HTTP.
    pub fn connect(endpoints: &[String], config: &StoreConfig) -> Result<Self> {
        let client = HttpConsulClient::new(endpoints, config)?;
        Self::new(Arc::new(client), config)
    }

    /// Runs a native call under the handle's timeout after checking that
    /// the shared session is still alive.
    async fn native<T, F>(&self, fut: F) -> Result<std::result::Result<T, ConsulError>>
    where
        F: Future<Output = std::result::Result<T, ConsulError>>,
    {
        self.sessions.check_shared()?;
        self.handle.call(async { Ok(fut.await) }).await
    }

    async fn read(&self, norm: &str) -> Result<Option<ConsulPair>> {
        self.native(self.client.get(norm, None))
            .await?
            .map(|(pair, _)| pair)
            .map_err(|e| map_error(norm, e))
    }

    /// Leaves under `norm`, filtered to whole path segments.
    async fn read_tree(&self, norm: &str) -> Result<Vec<ConsulPair>> {
        let (pairs, _) = self
            .native(self.client.list(norm, None))
            .await?
            .map_err(|e| map_error(norm, e))?;
        Ok(pairs
            .into_iter()
            .filter(|p| keys::has_prefix(&p.key, norm))
            .collect())
    }

    /// Rejects a ttl write onto an existing key that no session holds.
    async fn check_not_persistent(&self, norm: &str) -> Result<()> {
        match self.read(norm).await? {
            Some(pair) if pair.session.is_none() => Err(StoreError::EphemeralOnPersistent {
                key: norm.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Builds the write for `options`, attaching the shared session when a
    /// ttl is requested.
    async fn write_for(&self, value: &[u8], options: &WriteOptions) -> Result<KvWrite> {
        let acquire = match options.ephemeral_ttl() {
            Some(ttl) => Some(self.sessions.shared(ttl).await?.id().to_string()),
            None => None,
        };
        Ok(KvWrite {
            value: value.to_vec(),
            acquire,
            ..Default::default()
        })
    }

    /// Sends a write; an invalid session poisons the handle.
    async fn send_write(&self, norm: &str, write: KvWrite) -> Result<bool> {
        match self.native(self.client.put(norm, write)).await? {
            Ok(done) => Ok(done),
            Err(ConsulError::InvalidSession(msg)) => {
                self.sessions.mark_shared_lost().await;
                Err(StoreError::Unreachable(msg))
            }
            Err(e) => Err(map_error(norm, e)),
        }
    }

    /// Classifies a failed compare: the key is gone or it moved on.
    async fn cas_failure(&self, norm: &str) -> Result<StoreError> {
        Ok(match self.read(norm).await? {
            None => StoreError::not_found(norm),
            Some(_) => StoreError::KeyModified {
                key: norm.to_string(),
            },
        })
    }
}

/// Registers the Consul backend under `consul`.
pub fn register(registry: &Registry) {
    registry.register(Backend::Consul.as_str(), |endpoints, config| {
        Ok(Arc::new(ConsulStore::connect(&endpoints, &config)?) as Arc<dyn Store>)
    });
}

#[async_trait]
impl Store for ConsulStore {
    fn backend(&self) -> Backend {
        Backend::Consul
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn get(&self, key: &str) -> Result<KvPair> {
        let norm = keys::normalize_leaf(key)?;
        match self.read(&norm).await? {
            Some(pair) => Ok(pair_of(pair)),
            None => Err(StoreError::not_found(norm)),
        }
    }

    async fn put(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<()> {
        let norm = keys::normalize_leaf(key)?;
        if options.ephemeral_ttl().is_some() {
            self.check_not_persistent(&norm).await?;
        }
        let write = self.write_for(value, options).await?;
        if self.send_write(&norm, write).await? {
            Ok(())
        } else {
            // Only an acquire can be refused without a cas.
            Err(StoreError::KeyExists { key: norm })
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let norm = keys::normalize_leaf(key)?;
        if self.read(&norm).await?.is_none() {
            return Err(StoreError::not_found(norm));
        }
        self.native(self.client.delete(&norm, None, false))
            .await?
            .map(|_| ())
            .map_err(|e| map_error(&norm, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let norm = keys::normalize(prefix)?;
        let pairs = self.read_tree(&norm).await?;
        if pairs.is_empty() {
            return Err(StoreError::not_found(norm));
        }
        Ok(pairs.into_iter().map(pair_of).collect())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let norm = keys::normalize(prefix)?;
        // A plain recursive delete of `a` would also take `ab`.
        let targets: Vec<(String, bool)> = if norm.is_empty() {
            vec![(String::new(), true)]
        } else {
            vec![(norm.clone(), false), (format!("{}/", norm), true)]
        };
        for (target, recurse) in targets {
            self.native(self.client.delete(&target, None, recurse))
                .await?
                .map_err(|e| map_error(&norm, e))?;
        }
        Ok(())
    }

    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
        options: &WriteOptions,
    ) -> Result<KvPair> {
        let norm = keys::normalize_leaf(key)?;
        if options.ephemeral_ttl().is_some() && previous.is_some() {
            self.check_not_persistent(&norm).await?;
        }
        let mut write = self.write_for(value, options).await?;
        write.cas = Some(previous.map_or(0, |p| p.last_index));

        if !self.send_write(&norm, write).await? {
            return Err(match previous {
                None => StoreError::KeyExists { key: norm },
                Some(_) => self.cas_failure(&norm).await?,
            });
        }
        // The write only answers true/false; read back the new index.
        match self.read(&norm).await? {
            Some(pair) => Ok(pair_of(pair)),
            None => Err(StoreError::not_found(norm)),
        }
    }

    async fn atomic_delete(&self, key: &str, previous: Option<&KvPair>) -> Result<()> {
        let previous = previous.ok_or(StoreError::PreviousNotSpecified)?;
        let norm = keys::normalize_leaf(key)?;
        let deleted = self
            .native(self.client.delete(&norm, Some(previous.last_index), false))
            .await?
            .map_err(|e| map_error(&norm, e))?;
        if deleted {
            Ok(())
        } else {
            Err(self.cas_failure(&norm).await?)
        }
    }

    async fn watch(&self, key: &str, cancel: CancellationToken) -> Result<WatchStream> {
        self.sessions.check_shared()?;
        let norm = keys::normalize_leaf(key)?;
        let source = KeyWatch {
            client: self.client.clone(),
            norm: norm.clone(),
            wait: self.settings.watch_wait,
            index: 0,
        };
        spawn_watch(&self.handle, source, cancel, norm).await
    }

    async fn watch_tree(&self, prefix: &str, cancel: CancellationToken) -> Result<TreeWatchStream> {
        self.sessions.check_shared()?;
        let norm = keys::normalize(prefix)?;
        let source = TreeWatch {
            client: self.client.clone(),
            norm: norm.clone(),
            wait: self.settings.watch_wait,
            index: 0,
        };
        spawn_watch(&self.handle, source, cancel, norm).await
    }

    async fn new_lock(&self, key: &str, options: LockOptions) -> Result<Box<dyn Locker>> {
        self.handle.check_open()?;
        self.sessions.check_shared()?;
        let norm = keys::normalize_leaf(key)?;
        Ok(Box::new(lock::ConsulLock::new(
            self.client.clone(),
            self.handle.clone(),
            self.sessions.clone(),
            self.settings.clone(),
            norm,
            options,
        )))
    }

    async fn close(&self) {
        self.sessions.close().await;
        self.handle.close().await;
    }
}

/// Next blocking-query index. Consul indexes may go backwards after a
/// snapshot restore; start over from zero then.
fn advance(current: u64, returned: u64) -> u64 {
    if returned < current {
        0
    } else {
        returned
    }
}

/// Watches one key with blocking queries.
struct KeyWatch {
    client: Arc<dyn ConsulClient>,
    norm: String,
    wait: Duration,
    index: u64,
}

impl KeyWatch {
    async fn poll(&mut self, query: Option<BlockingQuery>) -> Result<Option<KvPair>> {
        let (pair, index) = self
            .client
            .get(&self.norm, query)
            .await
            .map_err(|e| map_error(&self.norm, e))?;
        let moved = index != self.index;
        self.index = advance(self.index, index);
        match pair {
            None => Err(StoreError::not_found(self.norm.clone())),
            Some(pair) if moved || query.is_none() => Ok(Some(pair_of(pair))),
            Some(_) => Ok(None),
        }
    }
}

#[async_trait]
impl WatchSource for KeyWatch {
    type Item = KvPair;

    async fn snapshot(&mut self) -> Result<KvPair> {
        self.poll(None)
            .await?
            .ok_or_else(|| StoreError::not_found(self.norm.clone()))
    }

    async fn next(&mut self) -> Result<KvPair> {
        loop {
            let query = BlockingQuery {
                index: self.index,
                wait: self.wait,
            };
            if let Some(pair) = self.poll(Some(query)).await? {
                return Ok(pair);
            }
        }
    }
}

/// Watches a prefix; every index change yields a fresh listing.
struct TreeWatch {
    client: Arc<dyn ConsulClient>,
    norm: String,
    wait: Duration,
    index: u64,
}

impl TreeWatch {
    async fn poll(&mut self, query: Option<BlockingQuery>) -> Result<Option<Vec<KvPair>>> {
        let (pairs, index) = self
            .client
            .list(&self.norm, query)
            .await
            .map_err(|e| map_error(&self.norm, e))?;
        let moved = index != self.index;
        self.index = advance(self.index, index);
        if !moved && query.is_some() {
            return Ok(None);
        }
        Ok(Some(
            pairs
                .into_iter()
                .filter(|p| keys::has_prefix(&p.key, &self.norm))
                .map(pair_of)
                .collect(),
        ))
    }
}

#[async_trait]
impl WatchSource for TreeWatch {
    type Item = Vec<KvPair>;

    async fn snapshot(&mut self) -> Result<Vec<KvPair>> {
        Ok(self.poll(None).await?.unwrap_or_default())
    }

    async fn next(&mut self) -> Result<Vec<KvPair>> {
        loop {
            let query = BlockingQuery {
                index: self.index,
                wait: self.wait,
            };
            if let Some(pairs) = self.poll(Some(query)).await? {
                return Ok(pairs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimConsul;
    use super::*;

    fn store(sim: &Arc<SimConsul>) -> ConsulStore {
        let config = StoreConfig::default()
            .with_timeout(Duration::from_secs(2))
            .with_option(OPT_WATCH_WAIT, "0.2")
            .with_option(OPT_MIN_TTL, "0.2");
        ConsulStore::new(sim.clone(), &config).unwrap()
    }

    #[test]
    fn test_map_error_kinds() {
        assert!(map_error("k", ConsulError::Unavailable("x".into())).is_transient());
        assert!(map_error("k", ConsulError::InvalidSession("x".into())).is_transient());
        let err = map_error(
            "k",
            ConsulError::Rejected {
                status: 403,
                message: "denied".into(),
            },
        );
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn test_advance_resets_on_backwards_index() {
        assert_eq!(advance(10, 12), 12);
        assert_eq!(advance(10, 10), 10);
        assert_eq!(advance(10, 3), 0);
    }

    #[tokio::test]
    async fn test_list_respects_segments() {
        let sim = SimConsul::new();
        let store = store(&sim);
        let opts = WriteOptions::default();
        store.put("swarm/a", b"1", &opts).await.unwrap();
        store.put("swarmy", b"2", &opts).await.unwrap();

        let listed = store.list("swarm").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "swarm/a");

        store.delete_tree("swarm").await.unwrap();
        assert!(store.list("swarm").await.unwrap_err().is_not_found());
        assert!(store.exists("swarmy").await.unwrap());
        store.close().await;
    }

    #[tokio::test]
    async fn test_ephemeral_keys_share_one_session() {
        let sim = SimConsul::new();
        let store = store(&sim);
        let opts = WriteOptions::with_ttl(Duration::from_millis(400));
        store.put("eph/a", b"1", &opts).await.unwrap();
        store.put("eph/b", b"2", &opts).await.unwrap();
        assert_eq!(sim.sessions().len(), 1);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(store.list("eph").await.unwrap().len(), 2);

        store.close().await;
        let (pairs, _) = sim.list("eph", None).await.unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_ephemeral_on_persistent_rejected() {
        let sim = SimConsul::new();
        let store = store(&sim);
        store.put("k", b"v", &WriteOptions::default()).await.unwrap();
        let err = store
            .put("k", b"v", &WriteOptions::with_ttl(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EphemeralOnPersistent { .. }));
        store.close().await;
    }

    #[tokio::test]
    async fn test_session_loss_makes_handle_unreachable() {
        let sim = SimConsul::new();
        let store = store(&sim);
        store
            .put("eph", b"v", &WriteOptions::with_ttl(Duration::from_millis(400)))
            .await
            .unwrap();
        for id in sim.sessions() {
            sim.expire_session(&id);
        }
        // The renewer notices at its next tick.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(matches!(
            store.get("other").await,
            Err(StoreError::Unreachable(_))
        ));
        store.close().await;
    }

    #[tokio::test]
    async fn test_cas_failures_are_classified() {
        let sim = SimConsul::new();
        let store = store(&sim);
        let opts = WriteOptions::default();
        let first = store.atomic_put("a", b"1", None, &opts).await.unwrap();
        assert!(matches!(
            store.atomic_put("a", b"x", None, &opts).await,
            Err(StoreError::KeyExists { .. })
        ));
        let second = store.atomic_put("a", b"2", Some(&first), &opts).await.unwrap();
        assert!(second.last_index > first.last_index);
        assert!(matches!(
            store.atomic_put("a", b"3", Some(&first), &opts).await,
            Err(StoreError::KeyModified { .. })
        ));
        assert!(matches!(
            store.atomic_delete("a", Some(&first)).await,
            Err(StoreError::KeyModified { .. })
        ));
        store.atomic_delete("a", Some(&second)).await.unwrap();
        assert!(matches!(
            store.atomic_delete("a", Some(&second)).await,
            Err(StoreError::NotFound { .. })
        ));
        store.close().await;
    }

    #[tokio::test]
    async fn test_watch_tree_starts_empty() {
        let sim = SimConsul::new();
        let store = store(&sim);
        let mut rx = store
            .watch_tree("nodes", CancellationToken::new())
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_empty());

        store.put("nodes/a", b"1", &WriteOptions::default()).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].key, "nodes/a");
        store.close().await;
    }

    #[tokio::test]
    async fn test_lock_lost_when_session_expires() {
        let sim = SimConsul::new();
        let store = store(&sim);
        let lock = store
            .new_lock("locks/a", LockOptions::with_ttl(Duration::from_millis(400)))
            .await
            .unwrap();
        let held = lock.acquire(CancellationToken::new()).await.unwrap();
        for id in sim.sessions() {
            sim.expire_session(&id);
        }
        tokio::time::timeout(Duration::from_secs(2), held.cancelled())
            .await
            .unwrap();
        lock.release().await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_renew_signal_releases_within_ttl() {
        let sim = SimConsul::new();
        let store = store(&sim);
        let signal = CancellationToken::new();
        let options = LockOptions::with_ttl(Duration::from_millis(400)).renew_signal(signal.clone());
        let lock = store.new_lock("locks/b", options).await.unwrap();
        let held = lock.acquire(CancellationToken::new()).await.unwrap();

        signal.cancel();
        tokio::time::timeout(Duration::from_secs(2), held.cancelled())
            .await
            .unwrap();
        assert!(!store.exists("locks/b").await.unwrap());
        store.close().await;
    }
}
