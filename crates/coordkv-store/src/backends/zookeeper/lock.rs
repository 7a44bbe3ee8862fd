//! ZooKeeper lock: ephemeral sequential nodes under the lock key.
//!
//! Each contender creates `<key>/lock-<seq>`. The lowest sequence holds the
//! lock; everyone else watches only its immediate predecessor, so a release
//! wakes exactly one waiter. The node belongs to the handle's session and
//! disappears with it, which is how a crashed holder lets go. The ttl and
//! renew signal have no effect here.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{CreateMode, WatchEventKind, ZkClient, ZkError};
use super::{create_parents, map_error};
use crate::backoff::Backoff;
use crate::error::{Result, StoreError};
use crate::handle::{cancellable, sleep_or_cancel, Handle};
use crate::keys;
use crate::lock::{Hold, LockCore};
use crate::store::Locker;
use crate::types::LockOptions;

const NODE_PREFIX: &str = "lock-";

/// Distributed lock on one ZooKeeper key. The token is the path of the
/// contender node this locker created.
pub struct ZkLock {
    client: Arc<dyn ZkClient>,
    handle: Arc<Handle>,
    core: Arc<LockCore<String>>,
    value: Vec<u8>,
}

impl ZkLock {
    pub(crate) fn new(
        client: Arc<dyn ZkClient>,
        handle: Arc<Handle>,
        key: String,
        options: LockOptions,
    ) -> Self {
        if options.renew_signal.is_some() {
            debug!(key = %key, "renew signal ignored, zookeeper locks follow the session");
        }
        Self {
            client,
            handle,
            core: Arc::new(LockCore::new(key)),
            value: options.value.unwrap_or_default(),
        }
    }

    async fn native<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, ZkError>>,
    {
        let key = self.core.key();
        self.handle
            .call(async { fut.await.map_err(|e| map_error(key, e)) })
            .await
    }

    /// Creates this contender's node and returns its full path.
    async fn enqueue(&self) -> Result<String> {
        let key = self.core.key();
        let node = keys::join(key, NODE_PREFIX);
        self.native(async {
            create_parents(self.client.as_ref(), &node).await?;
            let (path, _) = self
                .client
                .create(&keys::rooted(&node), &self.value, CreateMode::EphemeralSequential)
                .await?;
            Ok(path)
        })
        .await
    }

    /// Contender nodes in queue order.
    async fn queue(&self) -> Result<Vec<String>> {
        let dir = keys::rooted(self.core.key());
        let mut children = self.native(self.client.get_children(&dir)).await?;
        children.retain(|name| name.starts_with(NODE_PREFIX));
        // Sequence suffixes are zero padded, so name order is queue order.
        children.sort();
        Ok(children)
    }

    /// Waits until `own` is first in the queue.
    async fn wait_turn(&self, own: &str, cancel: &CancellationToken) -> Result<()> {
        let (_, own_name) = own.rsplit_once('/').unwrap_or(("", own));
        let dir = keys::rooted(self.core.key());
        let mut backoff = Backoff::default();

        loop {
            let queue = self.queue().await?;
            let position = queue
                .iter()
                .position(|name| name == own_name)
                .ok_or_else(|| {
                    StoreError::Backend(format!("lock node {} vanished while queued", own))
                })?;
            if position == 0 {
                return Ok(());
            }

            let predecessor = format!("{}/{}", dir, queue[position - 1]);
            let (stat, watcher) = self.native(self.client.exists_watch(&predecessor)).await?;
            if stat.is_none() {
                continue;
            }
            debug!(key = %self.core.key(), predecessor = %predecessor, "waiting for lock");
            let fired = cancellable(
                cancel,
                self.handle.call_untimed(async { Ok(watcher.await) }),
            )
            .await?;
            match fired {
                Ok(event) if event.kind == WatchEventKind::SessionExpired => {
                    return Err(map_error(self.core.key(), ZkError::SessionExpired));
                }
                Ok(_) => backoff.reset(),
                Err(_) => {
                    let delay = backoff.next_delay();
                    warn!(
                        key = %self.core.key(),
                        delay_ms = delay.as_millis() as u64,
                        "lock wait interrupted by connection loss"
                    );
                    sleep_or_cancel(cancel, delay).await?;
                }
            }
        }
    }

    /// Best-effort removal of a contender node.
    async fn withdraw(&self, own: &str) {
        match tokio::time::timeout(self.handle.timeout(), self.client.delete(own, None)).await {
            Ok(Ok(())) | Ok(Err(ZkError::NoNode)) => {}
            Ok(Err(e)) => warn!(node = %own, error = %e, "removing lock node failed"),
            Err(_) => warn!(node = %own, "removing lock node timed out"),
        }
    }

    fn spawn_keeper(&self, hold: Hold<String>) {
        let keeper = Keeper {
            client: self.client.clone(),
            core: self.core.clone(),
            closed: self.handle.child_token(),
        };
        self.handle.spawn(keeper.run(hold));
    }
}

#[async_trait]
impl Locker for ZkLock {
    async fn acquire(&self, cancel: CancellationToken) -> Result<CancellationToken> {
        self.core.ensure_unheld()?;
        let own = cancellable(&cancel, self.enqueue()).await?;

        if let Err(e) = self.wait_turn(&own, &cancel).await {
            self.withdraw(&own).await;
            return Err(e);
        }
        let hold = match self.core.mark_held(own.clone()) {
            Ok(hold) => hold,
            Err(e) => {
                self.withdraw(&own).await;
                return Err(e);
            }
        };
        debug!(key = %self.core.key(), node = %own, "lock acquired");
        self.spawn_keeper(hold.clone());
        Ok(hold.held)
    }

    async fn release(&self) -> Result<()> {
        let Some(hold) = self.core.take() else {
            return Ok(());
        };
        let deleted = self.native(self.client.delete(&hold.token, None)).await;
        hold.held.cancel();
        match deleted {
            Ok(()) => {
                debug!(key = %self.core.key(), "lock released");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Background task watching the held node.
struct Keeper {
    client: Arc<dyn ZkClient>,
    core: Arc<LockCore<String>>,
    closed: CancellationToken,
}

impl Keeper {
    async fn run(self, hold: Hold<String>) {
        let node = hold.token.clone();
        let mut backoff = Backoff::default();

        loop {
            let armed = tokio::select! {
                biased;
                _ = hold.stop.cancelled() => return,
                armed = self.client.exists_watch(&node) => armed,
            };
            let watcher = match armed {
                Ok((Some(_), watcher)) => watcher,
                Ok((None, _)) => {
                    self.core.mark_lost("lock node deleted");
                    return;
                }
                Err(ZkError::SessionExpired) => {
                    self.core.mark_lost("zookeeper session expired");
                    return;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(key = %self.core.key(), error = %e, "lock watch failed");
                    tokio::select! {
                        _ = hold.stop.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };
            backoff.reset();

            tokio::select! {
                biased;
                _ = hold.stop.cancelled() => return,
                _ = self.closed.cancelled() => {
                    self.core.mark_lost("store handle closed");
                    return;
                }
                fired = watcher => match fired {
                    Ok(event) if event.kind == WatchEventKind::NodeDeleted => {
                        self.core.mark_lost("lock node deleted");
                        return;
                    }
                    Ok(event) if event.kind == WatchEventKind::SessionExpired => {
                        self.core.mark_lost("zookeeper session expired");
                        return;
                    }
                    // Data change or a dropped connection: re-arm.
                    _ => {}
                },
            }
        }
    }
}

impl std::fmt::Debug for ZkLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZkLock")
            .field("key", &self.core.key())
            .field("phase", &self.core.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::sim::SimZk;
    use super::super::ZkStore;
    use crate::config::StoreConfig;
    use crate::store::Store;

    use super::*;

    fn store(zk: &Arc<SimZk>) -> (ZkStore, u64) {
        let client = zk.connect();
        let session = client.session_id();
        let config = StoreConfig::default().with_timeout(Duration::from_secs(2));
        (ZkStore::new(client, &config), session)
    }

    #[tokio::test]
    async fn test_lock_hands_over_in_order() {
        let zk = SimZk::new();
        let (a, _) = store(&zk);
        let (b, _) = store(&zk);
        let lock_a = a
            .new_lock("locks/job", LockOptions::default().value("a"))
            .await
            .unwrap();
        let lock_b = b.new_lock("locks/job", LockOptions::default()).await.unwrap();

        let held_a = lock_a.acquire(CancellationToken::new()).await.unwrap();
        let waiting = tokio::spawn(async move {
            let held = lock_b.acquire(CancellationToken::new()).await;
            (lock_b, held)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        lock_a.release().await.unwrap();
        assert!(held_a.is_cancelled());
        let (lock_b, held_b) = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap();
        let held_b = held_b.unwrap();
        assert!(!held_b.is_cancelled());
        lock_b.release().await.unwrap();
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_lock_lost_when_session_expires() {
        let zk = SimZk::new();
        let (a, session) = store(&zk);
        let lock = a.new_lock("locks/job", LockOptions::default()).await.unwrap();
        let held = lock.acquire(CancellationToken::new()).await.unwrap();
        zk.expire_session(session);
        tokio::time::timeout(Duration::from_secs(2), held.cancelled())
            .await
            .unwrap();
        a.close().await;
    }

    #[tokio::test]
    async fn test_lock_lost_on_external_delete() {
        let zk = SimZk::new();
        let (a, _) = store(&zk);
        let (other, _) = store(&zk);
        let lock = a.new_lock("locks/job", LockOptions::default()).await.unwrap();
        let held = lock.acquire(CancellationToken::new()).await.unwrap();
        other.delete_tree("locks/job").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), held.cancelled())
            .await
            .unwrap();
        a.close().await;
        other.close().await;
    }

    #[tokio::test]
    async fn test_cancelled_acquire_leaves_queue() {
        let zk = SimZk::new();
        let (a, _) = store(&zk);
        let (b, _) = store(&zk);
        let lock_a = a.new_lock("locks/job", LockOptions::default()).await.unwrap();
        let lock_b = b.new_lock("locks/job", LockOptions::default()).await.unwrap();
        let _held = lock_a.acquire(CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = lock_b.acquire(cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(a.list("locks/job").await.unwrap().len(), 1);
        lock_a.release().await.unwrap();
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_relock_after_release() {
        let zk = SimZk::new();
        let (a, _) = store(&zk);
        let lock = a.new_lock("locks/job", LockOptions::default()).await.unwrap();
        let first = lock.acquire(CancellationToken::new()).await.unwrap();
        assert!(lock.acquire(CancellationToken::new()).await.is_err());
        lock.release().await.unwrap();
        assert!(first.is_cancelled());
        let second = lock.acquire(CancellationToken::new()).await.unwrap();
        assert!(!second.is_cancelled());
        lock.release().await.unwrap();
        a.close().await;
    }
}
