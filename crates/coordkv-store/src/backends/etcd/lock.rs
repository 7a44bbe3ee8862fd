//! etcd lock: a create-only key with a ttl.
//!
//! Acquire creates the key with `prevExist=false`; losers long-poll the key
//! until it is deleted or expires and try again. While held, a keeper task
//! refreshes the ttl every `ttl / 2` with a compare-and-swap on the index
//! captured at acquire, and watches the key: any foreign write, deletion or
//! expiry means the lock is lost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{codes, DeleteRequest, EtcdClient, EtcdError, SetRequest};
use super::{map_error, EtcdSettings};
use crate::backoff::Backoff;
use crate::config::raise_ttl;
use crate::error::Result;
use crate::handle::{cancellable, sleep_or_cancel, Handle};
use crate::keys;
use crate::lock::{lock_ttl, renew_stopped, Hold, LockCore};
use crate::store::Locker;
use crate::types::{Backend, LockOptions};

/// Distributed lock on one etcd key.
pub struct EtcdLock {
    client: Arc<dyn EtcdClient>,
    handle: Arc<Handle>,
    settings: EtcdSettings,
    core: Arc<LockCore<u64>>,
    rooted: String,
    value: Vec<u8>,
    ttl: Duration,
    renew_signal: Option<CancellationToken>,
    keeper: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdLock {
    pub(crate) fn new(
        client: Arc<dyn EtcdClient>,
        handle: Arc<Handle>,
        settings: EtcdSettings,
        key: String,
        options: LockOptions,
    ) -> Self {
        let ttl = raise_ttl(lock_ttl(options.ttl), settings.min_ttl, Backend::Etcd);
        Self {
            client,
            handle,
            settings,
            rooted: keys::rooted(&key),
            core: Arc::new(LockCore::new(key)),
            value: options.value.unwrap_or_default(),
            ttl,
            renew_signal: options.renew_signal,
            keeper: Mutex::new(None),
        }
    }

    async fn native<T, F>(&self, fut: F) -> Result<std::result::Result<T, EtcdError>>
    where
        F: std::future::Future<Output = std::result::Result<T, EtcdError>>,
    {
        self.handle.call(async { Ok(fut.await) }).await
    }

    /// Blocks until the current holder's key is gone (or might be).
    async fn wait_for_release(&self, cancel: &CancellationToken) -> Result<()> {
        let key = self.core.key();
        let current = cancellable(cancel, self.native(self.client.get(&self.rooted, false))).await?;
        let mut index = match current {
            Ok(resp) => resp.index.max(resp.node.modified_index) + 1,
            Err(e) if e.code() == Some(codes::KEY_NOT_FOUND) => return Ok(()),
            Err(e) => return Err(map_error(key, e)),
        };

        loop {
            let polled = cancellable(
                cancel,
                self.handle.call_untimed(async {
                    Ok(self
                        .client
                        .wait(&self.rooted, false, index, self.settings.watch_wait)
                        .await)
                }),
            )
            .await?;
            match polled {
                Ok(None) => continue,
                Ok(Some(event)) if event.is_removal() => return Ok(()),
                Ok(Some(event)) => index = event.node.modified_index + 1,
                // History gone: retry the create, which re-reads the state.
                Err(e) if e.code() == Some(codes::EVENT_INDEX_CLEARED) => return Ok(()),
                Err(e) => return Err(map_error(key, e)),
            }
        }
    }

    fn spawn_keeper(&self, hold: Hold<u64>) {
        let keeper = Keeper {
            client: self.client.clone(),
            core: self.core.clone(),
            rooted: self.rooted.clone(),
            ttl: self.ttl,
            wait: self.settings.watch_wait,
            call_timeout: self.handle.timeout(),
            renew_signal: self.renew_signal.clone(),
            closed: self.handle.child_token(),
        };
        let task = self.handle.spawn_joinable(keeper.run(hold));
        if let Ok(mut slot) = self.keeper.lock() {
            *slot = Some(task);
        }
    }

    /// Stops the keeper and waits for it, so a refresh in flight has
    /// recorded its new index before the hold is taken.
    async fn stop_keeper(&self) {
        let Some(hold) = self.core.current() else {
            return;
        };
        hold.stop.cancel();
        let task = self.keeper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if tokio::time::timeout(self.handle.timeout(), task).await.is_err() {
                warn!(key = %self.core.key(), "lock keeper did not stop in time");
            }
        }
    }
}

#[async_trait]
impl Locker for EtcdLock {
    async fn acquire(&self, cancel: CancellationToken) -> Result<CancellationToken> {
        self.core.ensure_unheld()?;
        let key = self.core.key().to_string();
        let mut backoff = Backoff::default();

        loop {
            self.handle.check_open()?;
            let request = SetRequest {
                value: self.value.clone(),
                ttl: Some(self.ttl),
                prev_exist: Some(false),
                ..Default::default()
            };
            let attempt = cancellable(&cancel, self.native(self.client.set(&self.rooted, request)))
                .await;

            let outcome = match attempt {
                Ok(Ok(node)) => {
                    let hold = self.core.mark_held(node.modified_index)?;
                    debug!(key = %key, index = node.modified_index, "lock acquired");
                    self.spawn_keeper(hold.clone());
                    return Ok(hold.held);
                }
                Ok(Err(e)) if e.code() == Some(codes::NODE_EXIST) => {
                    backoff.reset();
                    self.wait_for_release(&cancel).await
                }
                Ok(Err(e)) => Err(map_error(&key, e)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!(
                        key = %key,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "lock acquire retrying"
                    );
                    sleep_or_cancel(&cancel, delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn release(&self) -> Result<()> {
        self.stop_keeper().await;
        let Some(hold) = self.core.take() else {
            return Ok(());
        };
        let request = DeleteRequest {
            prev_index: Some(hold.token),
            ..Default::default()
        };
        let res = self.native(self.client.delete(&self.rooted, request)).await;
        hold.held.cancel();
        match res? {
            Ok(_) => {
                debug!(key = %self.core.key(), "lock released");
                Ok(())
            }
            Err(e) if matches!(e.code(), Some(codes::KEY_NOT_FOUND) | Some(codes::TEST_FAILED)) => {
                debug!(key = %self.core.key(), "lock key already gone or taken over");
                Ok(())
            }
            Err(e) => Err(map_error(self.core.key(), e)),
        }
    }
}

/// Background task owning a held lock: renews and watches it.
struct Keeper {
    client: Arc<dyn EtcdClient>,
    core: Arc<LockCore<u64>>,
    rooted: String,
    ttl: Duration,
    wait: Duration,
    call_timeout: Duration,
    renew_signal: Option<CancellationToken>,
    closed: CancellationToken,
}

impl Keeper {
    async fn run(self, hold: Hold<u64>) {
        let mut renewing = true;
        let mut watch_index = hold.token + 1;
        let mut backoff = Backoff::default();
        let period = self.ttl / 2;
        let mut next_refresh = tokio::time::Instant::now() + period;

        loop {
            tokio::select! {
                biased;
                _ = hold.stop.cancelled() => return,
                _ = self.closed.cancelled() => {
                    self.core.mark_lost("store handle closed");
                    return;
                }
                _ = renew_stopped(&self.renew_signal), if renewing => {
                    debug!(key = %self.core.key(), "lock renewal stopped by caller");
                    renewing = false;
                }
                _ = tokio::time::sleep_until(next_refresh), if renewing => {
                    if !self.refresh().await {
                        return;
                    }
                    next_refresh = tokio::time::Instant::now() + period;
                }
                polled = self.client.wait(&self.rooted, false, watch_index, self.wait) => {
                    match polled {
                        Ok(None) => {}
                        Ok(Some(event)) => {
                            // The keeper's own refreshes do not notify, so
                            // any event is someone else's doing.
                            let reason = if event.is_removal() {
                                "lock key deleted or expired"
                            } else {
                                "lock key overwritten"
                            };
                            self.core.mark_lost(reason);
                            return;
                        }
                        Err(e) if e.code() == Some(codes::EVENT_INDEX_CLEARED) => {
                            match self.client.get(&self.rooted, false).await {
                                Ok(resp) if Some(resp.node.modified_index) == self.token() => {
                                    watch_index = resp.index + 1;
                                }
                                _ => {
                                    self.core.mark_lost("lock key changed while unobserved");
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let delay = backoff.next_delay().min(self.ttl / 4);
                            warn!(key = %self.core.key(), error = %e, "lock watch failed");
                            tokio::select! {
                                _ = hold.stop.cancelled() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    fn token(&self) -> Option<u64> {
        self.core.current().map(|hold| hold.token)
    }

    /// Refreshes the ttl. Returns false once the lock is lost.
    async fn refresh(&self) -> bool {
        let Some(token) = self.token() else {
            return false;
        };
        let request = SetRequest {
            ttl: Some(self.ttl),
            refresh: true,
            prev_index: Some(token),
            ..Default::default()
        };
        match tokio::time::timeout(self.call_timeout, self.client.set(&self.rooted, request)).await
        {
            Ok(Ok(node)) => {
                self.core.update_token(node.modified_index);
                true
            }
            Ok(Err(e))
                if matches!(e.code(), Some(codes::KEY_NOT_FOUND) | Some(codes::TEST_FAILED)) =>
            {
                self.core.mark_lost("lock refresh rejected");
                false
            }
            Ok(Err(e)) => {
                warn!(key = %self.core.key(), error = %e, "lock refresh failed");
                true
            }
            Err(_) => {
                warn!(key = %self.core.key(), "lock refresh timed out");
                true
            }
        }
    }
}

impl std::fmt::Debug for EtcdLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdLock")
            .field("key", &self.core.key())
            .field("ttl", &self.ttl)
            .field("phase", &self.core.phase())
            .finish()
    }
}
