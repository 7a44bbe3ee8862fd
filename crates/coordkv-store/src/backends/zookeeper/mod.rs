//! Hierarchical backend (ZooKeeper).
//!
//! `last_index` is the node's `mzxid`, which grows with every change to the
//! node and never repeats. Compare-and-swap checks it against the stored
//! pair and then writes at the node version read alongside, so a change in
//! between surfaces as `KeyModified`. Ephemeral writes create ephemeral
//! nodes owned by the handle's session; the ttl is advisory. Watches are
//! one-shot and re-armed by re-reading after every fire.

pub mod client;
pub mod lock;
pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::select_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::client::{CreateMode, Stat, WatchEventKind, Watcher, ZkClient, ZkConnector, ZkError};
use crate::config::{StoreConfig, OPT_SESSION_TTL};
use crate::error::{Result, StoreError};
use crate::handle::Handle;
use crate::keys;
use crate::registry::Registry;
use crate::store::{Locker, Store, TreeWatchStream, WatchStream};
use crate::types::{Backend, Capabilities, KvPair, LockOptions, WriteOptions};
use crate::watch::{spawn_watch, WatchSource};

/// Session timeout when `session_ttl` is not configured.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// ZooKeeper's own bookkeeping subtree, left alone by `delete_tree("")`.
const RESERVED: &str = "zookeeper";

/// Maps a ZooKeeper error for `key` to the contract's kinds.
pub fn map_error(key: &str, e: ZkError) -> StoreError {
    match e {
        ZkError::NoNode => StoreError::not_found(key),
        ZkError::NodeExists => StoreError::KeyExists {
            key: key.to_string(),
        },
        ZkError::BadVersion => StoreError::KeyModified {
            key: key.to_string(),
        },
        ZkError::ConnectionLoss(msg) => StoreError::Unreachable(msg),
        other => StoreError::Backend(format!("{} (key {})", other, key)),
    }
}

fn path_of(norm: &str) -> String {
    keys::rooted(norm)
}

fn pair_of(norm: &str, data: Vec<u8>, stat: &Stat) -> KvPair {
    KvPair::new(norm, data, stat.mzxid)
}

/// Creates every missing ancestor of `path` as an empty persistent node.
pub(crate) async fn create_parents(client: &dyn ZkClient, norm: &str) -> std::result::Result<(), ZkError> {
    for dir in keys::ancestors(norm) {
        match client.create(&path_of(dir), &[], CreateMode::Persistent).await {
            Ok(_) | Err(ZkError::NodeExists) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Registers the ZooKeeper backend under `zk`, opening sessions through
/// `connector`.
pub fn register(registry: &Registry, connector: Arc<dyn ZkConnector>) {
    registry.register(Backend::Zookeeper.as_str(), move |endpoints, config| {
        Ok(Arc::new(ZkStore::connect(connector.as_ref(), &endpoints, &config)?) as Arc<dyn Store>)
    });
}

/// ZooKeeper-backed store handle. One handle is one session.
pub struct ZkStore {
    client: Arc<dyn ZkClient>,
    handle: Arc<Handle>,
}

impl ZkStore {
    /// Wraps a connected client.
    pub fn new(client: Arc<dyn ZkClient>, config: &StoreConfig) -> Self {
        Self {
            client,
            handle: Arc::new(Handle::new(config.connection_timeout())),
        }
    }

    /// Opens a session through `connector`.
    pub fn connect(
        connector: &dyn ZkConnector,
        endpoints: &[String],
        config: &StoreConfig,
    ) -> Result<Self> {
        let session_timeout = config
            .duration_option(OPT_SESSION_TTL)?
            .unwrap_or(DEFAULT_SESSION_TIMEOUT);
        let client = connector
            .connect(endpoints, session_timeout, config)
            .map_err(|e| map_error("", e))?;
        Ok(Self::new(client, config))
    }

    async fn native<T, F>(&self, fut: F) -> Result<std::result::Result<T, ZkError>>
    where
        F: std::future::Future<Output = std::result::Result<T, ZkError>>,
    {
        self.handle.call(async { Ok(fut.await) }).await
    }

    async fn call<T, F>(&self, norm: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, ZkError>>,
    {
        self.native(fut).await?.map_err(|e| map_error(norm, e))
    }

    async fn check_not_persistent(&self, norm: &str) -> Result<()> {
        match self.call(norm, self.client.exists(&path_of(norm))).await? {
            Some(stat) if !stat.is_ephemeral() => Err(StoreError::EphemeralOnPersistent {
                key: norm.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Creates the node, making parents first. Returns the new stat.
    async fn create_node(&self, norm: &str, value: &[u8], mode: CreateMode) -> Result<Stat> {
        let path = path_of(norm);
        self.call(norm, async {
            create_parents(self.client.as_ref(), norm).await?;
            self.client.create(&path, value, mode).await.map(|(_, stat)| stat)
        })
        .await
    }

    /// Childless nodes under `norm`, depth first in key order. `norm`
    /// itself counts only when `include_self` is set.
    async fn collect_leaves(
        &self,
        norm: &str,
        include_self: bool,
        out: &mut Vec<KvPair>,
    ) -> std::result::Result<(), ZkError> {
        let mut pending = vec![(norm.to_string(), include_self)];
        while let Some((current, counts)) = pending.pop() {
            let path = path_of(&current);
            let children = match self.client.get_children(&path).await {
                Ok(children) => children,
                // Raced with a delete below the prefix.
                Err(ZkError::NoNode) if current != norm => continue,
                Err(e) => return Err(e),
            };
            if children.is_empty() {
                if counts {
                    match self.client.get_data(&path).await {
                        Ok((data, stat)) => out.push(pair_of(&current, data, &stat)),
                        Err(ZkError::NoNode) => {}
                        Err(e) => return Err(e),
                    }
                }
                continue;
            }
            let mut children = children;
            children.sort();
            for child in children.into_iter().rev() {
                if current.is_empty() && child == RESERVED {
                    continue;
                }
                pending.push((keys::join(&current, &child), true));
            }
        }
        Ok(())
    }

    /// Deletes `norm` and everything below it, children first.
    async fn remove_subtree(&self, norm: &str) -> std::result::Result<(), ZkError> {
        let mut order = Vec::new();
        let mut pending = vec![norm.to_string()];
        while let Some(current) = pending.pop() {
            match self.client.get_children(&path_of(&current)).await {
                Ok(children) => {
                    for child in children {
                        if current.is_empty() && child == RESERVED {
                            continue;
                        }
                        pending.push(keys::join(&current, &child));
                    }
                }
                Err(ZkError::NoNode) => continue,
                Err(e) => return Err(e),
            }
            order.push(current);
        }
        for node in order.into_iter().rev() {
            if node.is_empty() {
                continue;
            }
            match self.client.delete(&path_of(&node), None).await {
                Ok(()) | Err(ZkError::NoNode) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for ZkStore {
    fn backend(&self) -> Backend {
        Backend::Zookeeper
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn get(&self, key: &str) -> Result<KvPair> {
        let norm = keys::normalize_leaf(key)?;
        let (data, stat) = self.call(&norm, self.client.get_data(&path_of(&norm))).await?;
        Ok(pair_of(&norm, data, &stat))
    }

    async fn put(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<()> {
        let norm = keys::normalize_leaf(key)?;
        let mode = if options.ephemeral_ttl().is_some() {
            self.check_not_persistent(&norm).await?;
            CreateMode::Ephemeral
        } else {
            CreateMode::Persistent
        };
        let path = path_of(&norm);
        // Update in place, else create; a create race falls back to update.
        for _ in 0..2 {
            match self.native(self.client.set_data(&path, value, None)).await? {
                Ok(_) => return Ok(()),
                Err(ZkError::NoNode) => {}
                Err(e) => return Err(map_error(&norm, e)),
            }
            match self.create_node(&norm, value, mode).await {
                Ok(_) => return Ok(()),
                Err(StoreError::KeyExists { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::KeyModified { key: norm })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let norm = keys::normalize_leaf(key)?;
        self.call(&norm, self.client.delete(&path_of(&norm), None)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let norm = keys::normalize_leaf(key)?;
        let stat = self.call(&norm, self.client.exists(&path_of(&norm))).await?;
        Ok(stat.is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let norm = keys::normalize(prefix)?;
        let mut out = Vec::new();
        // The prefix itself is reported only if it holds a value.
        let include_self = match self.native(self.client.get_data(&path_of(&norm))).await? {
            Ok((data, stat)) => stat.num_children == 0 && !data.is_empty(),
            Err(e) => return Err(map_error(&norm, e)),
        };
        self.call(&norm, self.collect_leaves(&norm, include_self, &mut out))
            .await?;
        Ok(out)
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let norm = keys::normalize(prefix)?;
        self.call(&norm, self.remove_subtree(&norm)).await
    }

    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
        options: &WriteOptions,
    ) -> Result<KvPair> {
        let norm = keys::normalize_leaf(key)?;
        let ephemeral = options.ephemeral_ttl().is_some();
        let Some(previous) = previous else {
            let mode = if ephemeral {
                CreateMode::Ephemeral
            } else {
                CreateMode::Persistent
            };
            let stat = self.create_node(&norm, value, mode).await?;
            return Ok(pair_of(&norm, value.to_vec(), &stat));
        };

        let path = path_of(&norm);
        let (_, current) = self.call(&norm, self.client.get_data(&path)).await?;
        if current.mzxid != previous.last_index {
            return Err(StoreError::KeyModified { key: norm });
        }
        if ephemeral && !current.is_ephemeral() {
            return Err(StoreError::EphemeralOnPersistent { key: norm });
        }
        let stat = self
            .call(&norm, self.client.set_data(&path, value, Some(current.version)))
            .await?;
        Ok(pair_of(&norm, value.to_vec(), &stat))
    }

    async fn atomic_delete(&self, key: &str, previous: Option<&KvPair>) -> Result<()> {
        let previous = previous.ok_or(StoreError::PreviousNotSpecified)?;
        let norm = keys::normalize_leaf(key)?;
        let path = path_of(&norm);
        let (_, current) = self.call(&norm, self.client.get_data(&path)).await?;
        if current.mzxid != previous.last_index {
            return Err(StoreError::KeyModified { key: norm });
        }
        self.call(&norm, self.client.delete(&path, Some(current.version)))
            .await
    }

    async fn watch(&self, key: &str, cancel: CancellationToken) -> Result<WatchStream> {
        let norm = keys::normalize_leaf(key)?;
        let source = KeyWatch {
            client: self.client.clone(),
            path: path_of(&norm),
            norm: norm.clone(),
            watcher: None,
        };
        spawn_watch(&self.handle, source, cancel, norm).await
    }

    async fn watch_tree(&self, prefix: &str, cancel: CancellationToken) -> Result<TreeWatchStream> {
        let norm = keys::normalize(prefix)?;
        let source = TreeWatch {
            client: self.client.clone(),
            path: path_of(&norm),
            norm: norm.clone(),
            watchers: Vec::new(),
        };
        spawn_watch(&self.handle, source, cancel, norm).await
    }

    async fn new_lock(&self, key: &str, options: LockOptions) -> Result<Box<dyn Locker>> {
        self.handle.check_open()?;
        let norm = keys::normalize_leaf(key)?;
        Ok(Box::new(lock::ZkLock::new(
            self.client.clone(),
            self.handle.clone(),
            norm,
            options,
        )))
    }

    async fn close(&self) {
        self.handle.close().await;
        self.client.close().await;
    }
}

/// Outcome of waiting on a one-shot watch.
fn fired(
    norm: &str,
    event: std::result::Result<client::WatchEvent, tokio::sync::oneshot::error::RecvError>,
) -> Result<WatchEventKind> {
    match event {
        Ok(event) if event.kind == WatchEventKind::SessionExpired => Err(StoreError::Backend(
            format!("zookeeper session expired (watching {})", norm),
        )),
        Ok(event) => Ok(event.kind),
        Err(_) => Err(StoreError::Unreachable(format!(
            "watch on {} dropped by connection loss",
            norm
        ))),
    }
}

/// Watches one node: read with a data watch, wait for it to fire, re-read.
struct KeyWatch {
    client: Arc<dyn ZkClient>,
    path: String,
    norm: String,
    watcher: Option<Watcher>,
}

#[async_trait]
impl WatchSource for KeyWatch {
    type Item = KvPair;

    async fn snapshot(&mut self) -> Result<KvPair> {
        let (data, stat, watcher) = self
            .client
            .get_data_watch(&self.path)
            .await
            .map_err(|e| map_error(&self.norm, e))?;
        self.watcher = Some(watcher);
        Ok(pair_of(&self.norm, data, &stat))
    }

    async fn next(&mut self) -> Result<KvPair> {
        let Some(watcher) = self.watcher.take() else {
            return self.snapshot().await;
        };
        match fired(&self.norm, watcher.await)? {
            WatchEventKind::NodeDeleted => Err(StoreError::not_found(self.norm.clone())),
            // Re-read and re-arm; an unchanged value is dropped by the bridge.
            _ => self.snapshot().await,
        }
    }
}

/// Watches a prefix: a child watch on the prefix plus a data watch per
/// child. Any fire re-lists and re-arms everything.
struct TreeWatch {
    client: Arc<dyn ZkClient>,
    path: String,
    norm: String,
    watchers: Vec<Watcher>,
}

impl TreeWatch {
    async fn arm(&mut self) -> std::result::Result<Vec<KvPair>, ZkError> {
        loop {
            self.watchers.clear();
            let mut children = match self.client.get_children_watch(&self.path).await {
                Ok((children, watcher)) => {
                    self.watchers.push(watcher);
                    children
                }
                Err(ZkError::NoNode) => {
                    // Wait for the prefix to appear.
                    let (stat, watcher) = self.client.exists_watch(&self.path).await?;
                    if stat.is_some() {
                        continue;
                    }
                    self.watchers.push(watcher);
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            };
            children.sort();

            let mut pairs = Vec::with_capacity(children.len());
            for child in children {
                let norm = keys::join(&self.norm, &child);
                match self.client.get_data_watch(&path_of(&norm)).await {
                    Ok((data, stat, watcher)) => {
                        self.watchers.push(watcher);
                        pairs.push(pair_of(&norm, data, &stat));
                    }
                    // Deleted since the listing; the child watch has fired.
                    Err(ZkError::NoNode) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(pairs);
        }
    }
}

#[async_trait]
impl WatchSource for TreeWatch {
    type Item = Vec<KvPair>;

    async fn snapshot(&mut self) -> Result<Vec<KvPair>> {
        self.arm().await.map_err(|e| map_error(&self.norm, e))
    }

    async fn next(&mut self) -> Result<Vec<KvPair>> {
        if self.watchers.is_empty() {
            return self.snapshot().await;
        }
        let watchers = std::mem::take(&mut self.watchers);
        let (event, _, _) = select_all(watchers).await;
        let kind = fired(&self.norm, event)?;
        debug!(prefix = %self.norm, event = ?kind, "tree watch fired");
        self.snapshot().await
    }
}
