//! Consul sessions owned by one store handle.
//!
//! Ephemeral keys share one lazily created session; each lock gets its own
//! so that stopping a lock's renewal cannot take unrelated keys down with
//! it. Every session is renewed at `ttl / 2` by a task on the handle and
//! destroyed on close. Once the shared session is lost, the handle reports
//! `Unreachable` until it is reopened.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{ConsulClient, ConsulError, SessionBehavior, SessionSpec};
use crate::config::raise_ttl;
use crate::error::{Result, StoreError};
use crate::handle::Handle;
use crate::lock::renew_stopped;
use crate::types::Backend;

/// A live session and its lifecycle signals.
#[derive(Debug)]
pub struct Session {
    id: String,
    ttl: Duration,
    lost: CancellationToken,
    stop: CancellationToken,
}

impl Session {
    /// Session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session ttl as created.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True once the backend invalidated the session.
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves when the session is lost.
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    /// Records that the backend no longer knows the session.
    pub fn mark_lost(&self) {
        if !self.lost.is_cancelled() {
            warn!(session = %self.id, "consul session lost");
        }
        self.lost.cancel();
        self.stop.cancel();
    }
}

pub(crate) struct SessionManager {
    client: Arc<dyn ConsulClient>,
    handle: Arc<Handle>,
    min_ttl: Duration,
    configured_ttl: Option<Duration>,
    shared: tokio::sync::Mutex<Option<Arc<Session>>>,
    owned: Mutex<Vec<Arc<Session>>>,
}

impl SessionManager {
    pub(crate) fn new(
        client: Arc<dyn ConsulClient>,
        handle: Arc<Handle>,
        min_ttl: Duration,
        configured_ttl: Option<Duration>,
    ) -> Self {
        Self {
            client,
            handle,
            min_ttl,
            configured_ttl,
            shared: tokio::sync::Mutex::new(None),
            owned: Mutex::new(Vec::new()),
        }
    }

    /// Fails with `Unreachable` once the shared session has been lost.
    pub(crate) fn check_shared(&self) -> Result<()> {
        match self.shared.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(session) if session.is_lost() => Err(session_lost(session)),
                _ => Ok(()),
            },
            // Someone is creating it right now; it cannot be lost yet.
            Err(_) => Ok(()),
        }
    }

    /// The session ephemeral keys are attached to, created on first use.
    /// Its ttl is the configured `session_ttl`, else `ttl_hint`, raised to
    /// the backend minimum.
    pub(crate) async fn shared(&self, ttl_hint: Duration) -> Result<Arc<Session>> {
        let mut guard = self.shared.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_lost() {
                return Err(session_lost(session));
            }
            return Ok(session.clone());
        }
        let ttl = self.configured_ttl.unwrap_or(ttl_hint);
        let session = self.create("coordkv", ttl, None).await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Marks the shared session lost after the backend rejected it.
    pub(crate) async fn mark_shared_lost(&self) {
        if let Some(session) = self.shared.lock().await.as_ref() {
            session.mark_lost();
        }
    }

    /// A fresh session for one lock. Renewal stops when `renew_signal`
    /// fires, after which the session expires within its ttl.
    pub(crate) async fn dedicated(
        &self,
        ttl: Duration,
        renew_signal: Option<CancellationToken>,
    ) -> Result<Arc<Session>> {
        self.create("coordkv-lock", ttl, renew_signal).await
    }

    async fn create(
        &self,
        name: &str,
        ttl: Duration,
        renew_signal: Option<CancellationToken>,
    ) -> Result<Arc<Session>> {
        let ttl = raise_ttl(ttl, self.min_ttl, Backend::Consul);
        let spec = SessionSpec {
            name: name.to_string(),
            ttl,
            behavior: SessionBehavior::Delete,
            lock_delay: Duration::ZERO,
        };
        let id = self
            .handle
            .call(async {
                self.client
                    .create_session(&spec)
                    .await
                    .map_err(|e| StoreError::Unreachable(e.to_string()))
            })
            .await?;
        debug!(session = %id, ttl_ms = ttl.as_millis() as u64, "consul session created");

        let session = Arc::new(Session {
            id,
            ttl,
            lost: CancellationToken::new(),
            stop: self.handle.child_token(),
        });
        if let Ok(mut owned) = self.owned.lock() {
            owned.push(session.clone());
        }
        self.handle.spawn(renew_loop(
            self.client.clone(),
            session.clone(),
            self.handle.timeout(),
            renew_signal,
        ));
        Ok(session)
    }

    /// Stops renewing `session` and destroys it, deleting the keys it holds.
    pub(crate) async fn destroy(&self, session: &Arc<Session>) {
        session.stop.cancel();
        if let Ok(mut owned) = self.owned.lock() {
            owned.retain(|s| !Arc::ptr_eq(s, session));
        }
        destroy_quietly(self.client.as_ref(), session, self.handle.timeout()).await;
    }

    /// Destroys every session this handle created.
    pub(crate) async fn close(&self) {
        let sessions: Vec<Arc<Session>> = match self.owned.lock() {
            Ok(mut owned) => owned.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for session in sessions {
            session.stop.cancel();
            if !session.is_lost() {
                destroy_quietly(self.client.as_ref(), &session, self.handle.timeout()).await;
            }
        }
    }
}

fn session_lost(session: &Session) -> StoreError {
    StoreError::Unreachable(format!("consul session {} lost", session.id))
}

async fn destroy_quietly(client: &dyn ConsulClient, session: &Session, timeout: Duration) {
    match tokio::time::timeout(timeout, client.destroy_session(&session.id)).await {
        Ok(Ok(())) => debug!(session = %session.id, "consul session destroyed"),
        Ok(Err(e)) => warn!(session = %session.id, error = %e, "destroying consul session failed"),
        Err(_) => warn!(session = %session.id, "destroying consul session timed out"),
    }
}

async fn renew_loop(
    client: Arc<dyn ConsulClient>,
    session: Arc<Session>,
    call_timeout: Duration,
    renew_signal: Option<CancellationToken>,
) {
    let period = session.ttl / 2;
    let mut last_renewed = tokio::time::Instant::now();
    loop {
        tokio::select! {
            biased;
            _ = session.stop.cancelled() => return,
            _ = renew_stopped(&renew_signal) => {
                debug!(session = %session.id, "session renewal stopped by caller");
                return;
            }
            _ = tokio::time::sleep(period) => {}
        }
        match tokio::time::timeout(call_timeout, client.renew_session(&session.id)).await {
            Ok(Ok(())) => last_renewed = tokio::time::Instant::now(),
            Ok(Err(ConsulError::InvalidSession(_))) => {
                session.mark_lost();
                return;
            }
            Ok(Err(e)) => warn!(session = %session.id, error = %e, "session renew failed"),
            Err(_) => warn!(session = %session.id, "session renew timed out"),
        }
        if last_renewed.elapsed() >= session.ttl {
            session.mark_lost();
            return;
        }
    }
}
