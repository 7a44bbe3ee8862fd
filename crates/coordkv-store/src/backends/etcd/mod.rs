//! Leader-replicated backend (etcd v2 keys API).
//!
//! `last_index` is the node's `modifiedIndex`. Ephemeral keys carry an etcd
//! ttl and are refreshed every `ttl / 2` while the handle is open; closing
//! the handle stops the refreshers and the keys expire on their own.

pub mod client;
pub mod http;
pub mod lock;
pub mod sim;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::client::{codes, DeleteRequest, EtcdClient, EtcdError, EtcdNode, SetRequest};
use self::http::HttpEtcdClient;
use crate::config::{raise_ttl, StoreConfig, OPT_MIN_TTL, OPT_WATCH_WAIT};
use crate::error::{Result, StoreError};
use crate::handle::Handle;
use crate::keys;
use crate::registry::Registry;
use crate::store::{Locker, Store, TreeWatchStream, WatchStream};
use crate::types::{Backend, Capabilities, KvPair, LockOptions, WriteOptions};
use crate::watch::{spawn_watch, WatchSource};

/// Long-poll duration when `watch_wait` is not configured.
pub const DEFAULT_WATCH_WAIT: Duration = Duration::from_secs(30);
/// etcd ttls are whole seconds.
pub const DEFAULT_MIN_TTL: Duration = Duration::from_secs(1);

/// Maps an etcd error for `key` to the contract's kinds.
pub fn map_error(key: &str, e: EtcdError) -> StoreError {
    match e.code() {
        Some(codes::KEY_NOT_FOUND) => StoreError::not_found(key),
        Some(codes::TEST_FAILED) => StoreError::KeyModified {
            key: key.to_string(),
        },
        Some(codes::NODE_EXIST) => StoreError::KeyExists {
            key: key.to_string(),
        },
        _ => match e {
            EtcdError::Unavailable(msg) => StoreError::Unreachable(msg),
            other => StoreError::Backend(other.to_string()),
        },
    }
}

fn pair_of(node: &EtcdNode) -> KvPair {
    KvPair::new(
        node.key.trim_start_matches('/'),
        node.value.clone(),
        node.modified_index,
    )
}

/// Settings shared by the store, its watchers and its lockers.
#[derive(Debug, Clone)]
pub(crate) struct EtcdSettings {
    pub(crate) watch_wait: Duration,
    pub(crate) min_ttl: Duration,
}

/// etcd-backed store handle.
pub struct EtcdStore {
    client: Arc<dyn EtcdClient>,
    handle: Arc<Handle>,
    refreshers: Arc<DashMap<String, Refresher>>,
    generation: AtomicU64,
    settings: EtcdSettings,
}

/// Background ttl refresh for one ephemeral key.
#[derive(Debug)]
struct Refresher {
    generation: u64,
    stop: CancellationToken,
}

impl EtcdStore {
    /// Wraps a native client.
    pub fn new(client: Arc<dyn EtcdClient>, config: &StoreConfig) -> Result<Self> {
        let settings = EtcdSettings {
            watch_wait: config
                .duration_option(OPT_WATCH_WAIT)?
                .unwrap_or(DEFAULT_WATCH_WAIT),
            min_ttl: config
                .duration_option(OPT_MIN_TTL)?
                .unwrap_or(DEFAULT_MIN_TTL),
        };
        Ok(Self {
            client,
            handle: Arc::new(Handle::new(config.connection_timeout())),
            refreshers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            settings,
        })
    }

    /// Connects to etcd members over HTTP.
    pub fn connect(endpoints: &[String], config: &StoreConfig) -> Result<Self> {
        let client = HttpEtcdClient::new(endpoints, config)?;
        Self::new(Arc::new(client), config)
    }

    /// Runs a native call under the handle's timeout, keeping the etcd
    /// error for callers that branch on its code.
    async fn native<T, F>(&self, fut: F) -> Result<std::result::Result<T, EtcdError>>
    where
        F: Future<Output = std::result::Result<T, EtcdError>>,
    {
        self.handle.call(async { Ok(fut.await) }).await
    }

    async fn get_node(&self, rooted: &str, norm: &str, recursive: bool) -> Result<EtcdNode> {
        self.handle
            .call(async {
                self.client
                    .get(rooted, recursive)
                    .await
                    .map(|resp| resp.node)
                    .map_err(|e| map_error(norm, e))
            })
            .await
    }

    /// Writes, creating missing parent directories and retrying once when
    /// the backend reports a missing or non-directory parent.
    async fn set_with_parents(&self, norm: &str, request: SetRequest) -> Result<EtcdNode> {
        let rooted = keys::rooted(norm);
        let first = self.native(self.client.set(&rooted, request.clone())).await?;
        let may_create_parents = request.prev_index.is_none() && request.prev_exist != Some(true);
        match first {
            Ok(node) => Ok(node),
            Err(e)
                if may_create_parents
                    && matches!(e.code(), Some(codes::NOT_DIR) | Some(codes::KEY_NOT_FOUND)) =>
            {
                debug!(key = %norm, error = %e, "creating parent directories");
                self.make_parents(norm).await?;
                self.handle
                    .call(async {
                        self.client
                            .set(&rooted, request)
                            .await
                            .map_err(|e| map_error(norm, e))
                    })
                    .await
            }
            Err(e) => Err(map_error(norm, e)),
        }
    }

    async fn make_parents(&self, norm: &str) -> Result<()> {
        for dir in keys::ancestors(norm) {
            let request = SetRequest {
                dir: true,
                prev_exist: Some(false),
                ..Default::default()
            };
            let res = self.native(self.client.set(&keys::rooted(dir), request)).await?;
            match res {
                Ok(_) => {}
                Err(e) if matches!(e.code(), Some(codes::NODE_EXIST) | Some(codes::NOT_FILE)) => {}
                Err(e) => return Err(map_error(dir, e)),
            }
        }
        Ok(())
    }

    /// Rejects a ttl write onto an existing key that has no ttl.
    async fn check_not_persistent(&self, norm: &str) -> Result<()> {
        match self.get_node(&keys::rooted(norm), norm, false).await {
            Ok(node) if !node.dir && node.ttl.is_none() => Err(StoreError::EphemeralOnPersistent {
                key: norm.to_string(),
            }),
            Ok(_) => Ok(()),
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn effective_ttl(&self, options: &WriteOptions) -> Option<Duration> {
        options
            .ephemeral_ttl()
            .map(|ttl| raise_ttl(ttl, self.settings.min_ttl, Backend::Etcd))
    }

    fn stop_refresher(&self, norm: &str) {
        if let Some((_, refresher)) = self.refreshers.remove(norm) {
            refresher.stop.cancel();
        }
    }

    fn stop_refreshers_under(&self, prefix: &str) {
        self.refreshers.retain(|key, refresher| {
            if keys::has_prefix(key, prefix) {
                refresher.stop.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Keeps an ephemeral key alive by refreshing its ttl every `ttl / 2`.
    fn start_refresher(&self, norm: &str, ttl: Duration) {
        let token = self.handle.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let refresher = Refresher {
            generation,
            stop: token.clone(),
        };
        if let Some(old) = self.refreshers.insert(norm.to_string(), refresher) {
            old.stop.cancel();
        }
        let client = self.client.clone();
        let refreshers = self.refreshers.clone();
        let norm = norm.to_string();
        let rooted = keys::rooted(&norm);
        let period = ttl / 2;
        let timeout = self.handle.timeout();

        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let request = SetRequest {
                    ttl: Some(ttl),
                    refresh: true,
                    prev_exist: Some(true),
                    ..Default::default()
                };
                match tokio::time::timeout(timeout, client.set(&rooted, request)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) if e.code() == Some(codes::KEY_NOT_FOUND) => {
                        debug!(key = %norm, "ephemeral key gone, stopping refresh");
                        refreshers.remove_if(&norm, |_, r| r.generation == generation);
                        break;
                    }
                    Ok(Err(e)) => warn!(key = %norm, error = %e, "ttl refresh failed"),
                    Err(_) => warn!(key = %norm, "ttl refresh timed out"),
                }
            }
        });
    }
}

/// Registers the etcd backend under `etcd`.
pub fn register(registry: &Registry) {
    registry.register(Backend::Etcd.as_str(), |endpoints, config| {
        Ok(Arc::new(EtcdStore::connect(&endpoints, &config)?) as Arc<dyn Store>)
    });
}

#[async_trait]
impl Store for EtcdStore {
    fn backend(&self) -> Backend {
        Backend::Etcd
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn get(&self, key: &str) -> Result<KvPair> {
        let norm = keys::normalize_leaf(key)?;
        let node = self.get_node(&keys::rooted(&norm), &norm, false).await?;
        Ok(KvPair::new(
            norm,
            if node.dir { Vec::new() } else { node.value },
            node.modified_index,
        ))
    }

    async fn put(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<()> {
        let norm = keys::normalize_leaf(key)?;
        let ttl = self.effective_ttl(options);
        if ttl.is_some() {
            self.check_not_persistent(&norm).await?;
        } else {
            self.stop_refresher(&norm);
        }
        let request = SetRequest {
            value: value.to_vec(),
            ttl,
            dir: options.is_directory,
            ..Default::default()
        };
        self.set_with_parents(&norm, request).await?;
        if let Some(ttl) = ttl {
            self.start_refresher(&norm, ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let norm = keys::normalize_leaf(key)?;
        self.stop_refresher(&norm);
        self.handle
            .call(async {
                self.client
                    .delete(&keys::rooted(&norm), DeleteRequest::default())
                    .await
                    .map(|_| ())
                    .map_err(|e| map_error(&norm, e))
            })
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let norm = keys::normalize(prefix)?;
        let node = self.get_node(&keys::rooted(&norm), &norm, true).await?;
        Ok(node.leaves().into_iter().map(pair_of).collect())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let norm = keys::normalize(prefix)?;
        self.stop_refreshers_under(&norm);

        // The root itself cannot be deleted; remove its children instead.
        let targets = if norm.is_empty() {
            self.get_node("/", "", false)
                .await?
                .nodes
                .into_iter()
                .map(|n| n.key)
                .collect()
        } else {
            vec![keys::rooted(&norm)]
        };

        for target in targets {
            let request = DeleteRequest {
                recursive: true,
                ..Default::default()
            };
            let res = self.native(self.client.delete(&target, request)).await?;
            match res {
                Ok(_) => {}
                Err(e) if e.code() == Some(codes::KEY_NOT_FOUND) => {}
                Err(e) => return Err(map_error(&norm, e)),
            }
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
        let ttl = self.effective_ttl(options);
        if ttl.is_some() && previous.is_some() {
            self.check_not_persistent(&norm).await?;
        }
        let request = SetRequest {
            value: value.to_vec(),
            ttl,
            dir: options.is_directory,
            prev_exist: previous.is_none().then_some(false),
            prev_index: previous.map(|p| p.last_index),
            refresh: false,
        };
        let node = self.set_with_parents(&norm, request).await?;
        match ttl {
            Some(ttl) => self.start_refresher(&norm, ttl),
            None => self.stop_refresher(&norm),
        }
        Ok(KvPair::new(norm, value.to_vec(), node.modified_index))
    }

    async fn atomic_delete(&self, key: &str, previous: Option<&KvPair>) -> Result<()> {
        let previous = previous.ok_or(StoreError::PreviousNotSpecified)?;
        let norm = keys::normalize_leaf(key)?;
        let request = DeleteRequest {
            prev_index: Some(previous.last_index),
            ..Default::default()
        };
        self.handle
            .call(async {
                self.client
                    .delete(&keys::rooted(&norm), request)
                    .await
                    .map_err(|e| map_error(&norm, e))
            })
            .await?;
        self.stop_refresher(&norm);
        Ok(())
    }

    async fn watch(&self, key: &str, cancel: CancellationToken) -> Result<WatchStream> {
        let norm = keys::normalize_leaf(key)?;
        let source = KeyWatch {
            client: self.client.clone(),
            rooted: keys::rooted(&norm),
            norm: norm.clone(),
            wait: self.settings.watch_wait,
            next_index: 0,
        };
        spawn_watch(&self.handle, source, cancel, norm).await
    }

    async fn watch_tree(&self, prefix: &str, cancel: CancellationToken) -> Result<TreeWatchStream> {
        let norm = keys::normalize(prefix)?;
        let source = TreeWatch {
            client: self.client.clone(),
            rooted: keys::rooted(&norm),
            norm: norm.clone(),
            wait: self.settings.watch_wait,
            next_index: 0,
        };
        spawn_watch(&self.handle, source, cancel, norm).await
    }

    async fn new_lock(&self, key: &str, options: LockOptions) -> Result<Box<dyn Locker>> {
        self.handle.check_open()?;
        let norm = keys::normalize_leaf(key)?;
        Ok(Box::new(lock::EtcdLock::new(
            self.client.clone(),
            self.handle.clone(),
            self.settings.clone(),
            norm,
            options,
        )))
    }

    async fn close(&self) {
        self.stop_refreshers_under("");
        self.handle.close().await;
    }
}

/// Watches one key by long-polling from the last seen index.
struct KeyWatch {
    client: Arc<dyn EtcdClient>,
    rooted: String,
    norm: String,
    wait: Duration,
    next_index: u64,
}

#[async_trait]
impl WatchSource for KeyWatch {
    type Item = KvPair;

    async fn snapshot(&mut self) -> Result<KvPair> {
        let resp = self
            .client
            .get(&self.rooted, false)
            .await
            .map_err(|e| map_error(&self.norm, e))?;
        self.next_index = resp.index.max(resp.node.modified_index) + 1;
        Ok(KvPair::new(
            self.norm.clone(),
            resp.node.value,
            resp.node.modified_index,
        ))
    }

    async fn next(&mut self) -> Result<KvPair> {
        loop {
            match self
                .client
                .wait(&self.rooted, false, self.next_index, self.wait)
                .await
            {
                Ok(None) => continue,
                Ok(Some(event)) => {
                    self.next_index = event.node.modified_index + 1;
                    if event.is_removal() {
                        return Err(StoreError::not_found(self.norm.clone()));
                    }
                    if event.node.key != self.rooted {
                        continue;
                    }
                    return Ok(KvPair::new(
                        self.norm.clone(),
                        event.node.value,
                        event.node.modified_index,
                    ));
                }
                Err(e) if e.code() == Some(codes::EVENT_INDEX_CLEARED) => {
                    debug!(key = %self.norm, "watch index cleared, resyncing");
                    return self.snapshot().await;
                }
                Err(e) => return Err(map_error(&self.norm, e)),
            }
        }
    }
}

/// Watches a prefix: every change under it triggers a fresh listing.
struct TreeWatch {
    client: Arc<dyn EtcdClient>,
    rooted: String,
    norm: String,
    wait: Duration,
    next_index: u64,
}

#[async_trait]
impl WatchSource for TreeWatch {
    type Item = Vec<KvPair>;

    async fn snapshot(&mut self) -> Result<Vec<KvPair>> {
        match self.client.get(&self.rooted, true).await {
            Ok(resp) => {
                self.next_index = self.next_index.max(resp.index + 1);
                Ok(resp.node.leaves().into_iter().map(pair_of).collect())
            }
            Err(EtcdError::Api {
                code: codes::KEY_NOT_FOUND,
                index,
                ..
            }) => {
                self.next_index = self.next_index.max(index + 1);
                Ok(Vec::new())
            }
            Err(e) => Err(map_error(&self.norm, e)),
        }
    }

    async fn next(&mut self) -> Result<Vec<KvPair>> {
        loop {
            match self
                .client
                .wait(&self.rooted, true, self.next_index, self.wait)
                .await
            {
                Ok(None) => continue,
                Ok(Some(event)) => {
                    self.next_index = event.node.modified_index + 1;
                    return self.snapshot().await;
                }
                Err(e) if e.code() == Some(codes::EVENT_INDEX_CLEARED) => {
                    debug!(prefix = %self.norm, "watch index cleared, resyncing");
                    self.next_index = 0;
                    return self.snapshot().await;
                }
                Err(e) => return Err(map_error(&self.norm, e)),
            }
        }
    }
}
