//! Consul lock: a key acquired with a session of its own.
//!
//! Losers block on the key until it is released or deleted and try again.
//! While held, a keeper watches the key and the session: the key vanishing,
//! changing hands, or the session being invalidated means the lock is lost.
//! Stopping renewal lets the session expire, which deletes the key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{BlockingQuery, ConsulClient, ConsulError, ConsulPair, KvWrite};
use super::session::{Session, SessionManager};
use super::{map_error, ConsulSettings};
use crate::backoff::Backoff;
use crate::error::Result;
use crate::handle::{cancellable, sleep_or_cancel, Handle};
use crate::lock::{lock_ttl, Hold, LockCore};
use crate::store::Locker;
use crate::types::LockOptions;

/// What the lock remembers about a successful acquire.
#[derive(Debug, Clone)]
pub struct LockToken {
    session: Arc<Session>,
    modify_index: u64,
}

/// Distributed lock on one Consul key.
pub struct ConsulLock {
    client: Arc<dyn ConsulClient>,
    handle: Arc<Handle>,
    sessions: Arc<SessionManager>,
    settings: ConsulSettings,
    core: Arc<LockCore<LockToken>>,
    value: Vec<u8>,
    ttl: Duration,
    renew_signal: Option<CancellationToken>,
}

fn held_by(pair: &Option<ConsulPair>, session: &str) -> bool {
    matches!(pair, Some(p) if p.session.as_deref() == Some(session))
}

impl ConsulLock {
    pub(crate) fn new(
        client: Arc<dyn ConsulClient>,
        handle: Arc<Handle>,
        sessions: Arc<SessionManager>,
        settings: ConsulSettings,
        key: String,
        options: LockOptions,
    ) -> Self {
        Self {
            client,
            handle,
            sessions,
            settings,
            core: Arc::new(LockCore::new(key)),
            value: options.value.unwrap_or_default(),
            ttl: lock_ttl(options.ttl),
            renew_signal: options.renew_signal,
        }
    }

    async fn native<T, F>(&self, fut: F) -> Result<std::result::Result<T, ConsulError>>
    where
        F: std::future::Future<Output = std::result::Result<T, ConsulError>>,
    {
        self.handle.call(async { Ok(fut.await) }).await
    }

    /// Blocks until the key is free (absent or without a holder).
    async fn wait_for_release(&self, cancel: &CancellationToken) -> Result<()> {
        let key = self.core.key();
        let mut index = 0;
        loop {
            let query = (index > 0).then_some(BlockingQuery {
                index,
                wait: self.settings.watch_wait,
            });
            let polled = cancellable(
                cancel,
                self.handle
                    .call_untimed(async { Ok(self.client.get(key, query).await) }),
            )
            .await?;
            match polled {
                Ok((pair, next)) => {
                    if pair.as_ref().map_or(true, |p| p.session.is_none()) {
                        return Ok(());
                    }
                    index = if next < index { 0 } else { next };
                }
                Err(e) => return Err(map_error(key, e)),
            }
        }
    }

    async fn try_acquire(
        &self,
        session: &Arc<Session>,
    ) -> Result<std::result::Result<bool, ConsulError>> {
        let write = KvWrite {
            value: self.value.clone(),
            acquire: Some(session.id().to_string()),
            ..Default::default()
        };
        self.native(self.client.put(self.core.key(), write)).await
    }

    fn spawn_keeper(&self, hold: Hold<LockToken>) {
        let keeper = Keeper {
            client: self.client.clone(),
            core: self.core.clone(),
            wait: self.settings.watch_wait,
            closed: self.handle.child_token(),
        };
        self.handle.spawn(keeper.run(hold));
    }
}

#[async_trait]
impl Locker for ConsulLock {
    async fn acquire(&self, cancel: CancellationToken) -> Result<CancellationToken> {
        self.core.ensure_unheld()?;
        let key = self.core.key().to_string();
        let mut session = self
            .sessions
            .dedicated(self.ttl, self.renew_signal.clone())
            .await?;
        let mut backoff = Backoff::default();

        let result = loop {
            if let Err(e) = self.handle.check_open() {
                break Err(e);
            }
            let attempt = cancellable(&cancel, self.try_acquire(&session)).await;
            let outcome = match attempt {
                Ok(Ok(true)) => {
                    let modify_index = match self.native(self.client.get(&key, None)).await {
                        Ok(Ok((Some(pair), _))) => pair.modify_index,
                        _ => 0,
                    };
                    let token = LockToken {
                        session: session.clone(),
                        modify_index,
                    };
                    match self.core.mark_held(token) {
                        Ok(hold) => {
                            debug!(key = %key, session = %session.id(), "lock acquired");
                            self.spawn_keeper(hold.clone());
                            return Ok(hold.held);
                        }
                        Err(e) => break Err(e),
                    }
                }
                Ok(Ok(false)) => {
                    backoff.reset();
                    self.wait_for_release(&cancel).await
                }
                Ok(Err(ConsulError::InvalidSession(_))) => {
                    debug!(key = %key, "lock session gone before acquire, recreating");
                    session.mark_lost();
                    match self
                        .sessions
                        .dedicated(self.ttl, self.renew_signal.clone())
                        .await
                    {
                        Ok(fresh) => {
                            session = fresh;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
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
                    if let Err(e) = sleep_or_cancel(&cancel, delay).await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        self.sessions.destroy(&session).await;
        result
    }

    async fn release(&self) -> Result<()> {
        let Some(hold) = self.core.take() else {
            return Ok(());
        };
        let key = self.core.key();
        let deleted = self
            .native(self.client.delete(key, Some(hold.token.modify_index), false))
            .await;
        // Destroying the session drops the key too if the cas lost a race
        // with a foreign write.
        self.sessions.destroy(&hold.token.session).await;
        hold.held.cancel();
        match deleted? {
            Ok(true) => debug!(key = %key, "lock released"),
            Ok(false) => debug!(key = %key, "lock key changed before release"),
            Err(e) => return Err(map_error(key, e)),
        }
        Ok(())
    }
}

/// Background task watching a held lock.
struct Keeper {
    client: Arc<dyn ConsulClient>,
    core: Arc<LockCore<LockToken>>,
    wait: Duration,
    closed: CancellationToken,
}

impl Keeper {
    async fn run(self, hold: Hold<LockToken>) {
        let session = hold.token.session.clone();
        let mut index = 0;
        let mut backoff = Backoff::default();

        loop {
            let query = (index > 0).then_some(BlockingQuery {
                index,
                wait: self.wait,
            });
            tokio::select! {
                biased;
                _ = hold.stop.cancelled() => return,
                _ = self.closed.cancelled() => {
                    self.core.mark_lost("store handle closed");
                    return;
                }
                _ = session.lost() => {
                    self.core.mark_lost("lock session invalidated");
                    return;
                }
                polled = self.client.get(self.core.key(), query) => match polled {
                    Ok((pair, next)) => {
                        backoff.reset();
                        if !held_by(&pair, session.id()) {
                            let reason = if pair.is_none() {
                                "lock key deleted"
                            } else {
                                "lock key taken over"
                            };
                            self.core.mark_lost(reason);
                            return;
                        }
                        index = if next < index { 0 } else { next };
                    }
                    Err(e) => {
                        let delay = backoff.next_delay().min(session.ttl() / 4);
                        warn!(key = %self.core.key(), error = %e, "lock watch failed");
                        tokio::select! {
                            _ = hold.stop.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for ConsulLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulLock")
            .field("key", &self.core.key())
            .field("ttl", &self.ttl)
            .field("phase", &self.core.phase())
            .finish()
    }
}
