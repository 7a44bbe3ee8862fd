//! Lock bookkeeping shared by the backend lockers.
//!
//! A lock moves UNHELD -> HELD on a successful acquire and back to UNHELD on
//! release or loss. Loss (session gone, ttl expired, key deleted by someone
//! else) cancels the `held` token handed to the caller; release cancels it
//! too. Cancelling a token twice is a no-op, so `held` fires exactly once.

use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, StoreError};

/// Default lock ttl when the caller does not provide one.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(20);

/// Lock state as seen by the owning locker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockPhase {
    /// Not held.
    Unheld,
    /// Held; the backend token is recorded.
    Held,
}

/// Live hold on a lock.
#[derive(Debug, Clone)]
pub struct Hold<T> {
    /// Backend token captured at acquire (index, node path, session).
    pub token: T,
    /// Cancelled when the lock is lost or released.
    pub held: CancellationToken,
    /// Cancelled to stop the background renewal/monitor task.
    pub stop: CancellationToken,
}

/// State of one locker.
#[derive(Debug)]
pub struct LockCore<T> {
    key: String,
    hold: Mutex<Option<Hold<T>>>,
}

impl<T: Clone> LockCore<T> {
    /// Creates an unheld lock for `key`.
    pub fn new(key: String) -> Self {
        Self {
            key,
            hold: Mutex::new(None),
        }
    }

    /// Normalized lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current phase. A hold whose `held` token already fired counts as
    /// unheld.
    pub fn phase(&self) -> LockPhase {
        match self.hold.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(hold) if !hold.held.is_cancelled() => LockPhase::Held,
                _ => LockPhase::Unheld,
            },
            Err(_) => LockPhase::Unheld,
        }
    }

    /// Fails if this locker already holds the lock.
    pub fn ensure_unheld(&self) -> Result<()> {
        if self.phase() == LockPhase::Held {
            return Err(StoreError::Backend(format!(
                "lock {} already held by this locker",
                self.key
            )));
        }
        Ok(())
    }

    /// Records a successful acquire and returns the hold.
    pub fn mark_held(&self, token: T) -> Result<Hold<T>> {
        let hold = Hold {
            token,
            held: CancellationToken::new(),
            stop: CancellationToken::new(),
        };
        let mut guard = self
            .hold
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        *guard = Some(hold.clone());
        Ok(hold)
    }

    /// Current hold, if any.
    pub fn current(&self) -> Option<Hold<T>> {
        self.hold.lock().ok().and_then(|g| g.clone())
    }

    /// Replaces the backend token of the current hold (after a renewal
    /// changed it).
    pub fn update_token(&self, token: T) {
        if let Ok(mut guard) = self.hold.lock() {
            if let Some(hold) = guard.as_mut() {
                hold.token = token;
            }
        }
    }

    /// Removes the hold for release. Stops renewal; the caller deletes the
    /// backing key and then fires `held`.
    pub fn take(&self) -> Option<Hold<T>> {
        let hold = self.hold.lock().ok().and_then(|mut g| g.take());
        if let Some(hold) = &hold {
            hold.stop.cancel();
        }
        hold
    }

    /// Marks the lock lost: stops renewal and fires `held`.
    pub fn mark_lost(&self, reason: &str) {
        if let Some(hold) = self.current() {
            if !hold.held.is_cancelled() {
                warn!(key = %self.key, reason, "lock lost");
            }
            hold.stop.cancel();
            hold.held.cancel();
        }
    }
}

/// Effective ttl for a lock, falling back to [`DEFAULT_LOCK_TTL`].
pub fn lock_ttl(ttl: Option<Duration>) -> Duration {
    ttl.filter(|t| !t.is_zero()).unwrap_or(DEFAULT_LOCK_TTL)
}

/// Resolves when the caller's renew signal fires; never if there is none.
pub async fn renew_stopped(signal: &Option<CancellationToken>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let core: LockCore<u64> = LockCore::new("locks/a".into());
        assert_eq!(core.phase(), LockPhase::Unheld);
        let hold = core.mark_held(7).unwrap();
        assert_eq!(core.phase(), LockPhase::Held);
        assert!(core.ensure_unheld().is_err());

        core.update_token(9);
        assert_eq!(core.current().unwrap().token, 9);

        let taken = core.take().unwrap();
        assert!(taken.stop.is_cancelled());
        assert!(!hold.held.is_cancelled());
        assert_eq!(core.phase(), LockPhase::Unheld);
    }

    #[test]
    fn test_lost_fires_held_once() {
        let core: LockCore<u64> = LockCore::new("locks/a".into());
        let hold = core.mark_held(1).unwrap();
        core.mark_lost("session expired");
        core.mark_lost("again");
        assert!(hold.held.is_cancelled());
        assert!(hold.stop.is_cancelled());
        assert_eq!(core.phase(), LockPhase::Unheld);
    }

    #[test]
    fn test_lock_ttl_default() {
        assert_eq!(lock_ttl(None), DEFAULT_LOCK_TTL);
        assert_eq!(lock_ttl(Some(Duration::ZERO)), DEFAULT_LOCK_TTL);
        assert_eq!(
            lock_ttl(Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
    }
}
