//! Per-handle lifecycle: close signal, call timeouts, background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Result, StoreError};

/// Shared state every adapter embeds.
///
/// The root token is cancelled by `close`; every background task spawned
/// through the handle watches a child of it.
#[derive(Debug)]
pub struct Handle {
    closed: CancellationToken,
    tasks: TaskTracker,
    timeout: Duration,
}

impl Handle {
    /// Creates an open handle with the given per-call timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            closed: CancellationToken::new(),
            tasks: TaskTracker::new(),
            timeout,
        }
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fails with `Closed` once the handle is closed.
    pub fn check_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the handle closes.
    pub fn child_token(&self) -> CancellationToken {
        self.closed.child_token()
    }

    /// Runs one backend call bounded by the connection timeout.
    pub async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check_open()?;
        tokio::select! {
            _ = self.closed.cancelled() => Err(StoreError::Closed),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(StoreError::Timeout(self.timeout)),
            },
        }
    }

    /// Runs a long-poll backend call that is only bounded by close.
    pub async fn call_untimed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check_open()?;
        tokio::select! {
            _ = self.closed.cancelled() => Err(StoreError::Closed),
            res = fut => res,
        }
    }

    /// Spawns a background task owned by this handle.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    /// Like [`Handle::spawn`], returning the task's join handle so the
    /// caller can wait for it to finish.
    pub fn spawn_joinable<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(fut)
    }

    /// Cancels every background task and waits for them to stop.
    pub async fn close(&self) {
        self.closed.cancel();
        self.tasks.close();
        if tokio::time::timeout(self.timeout, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tasks.len(),
                "background tasks still running after close"
            );
        }
    }
}

/// Runs `fut` unless `cancel` fires first, in which case `Cancelled` is
/// returned.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        res = fut => res,
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_times_out() {
        let handle = Handle::new(Duration::from_millis(20));
        let res: Result<()> = handle
            .call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_calls() {
        let handle = Handle::new(Duration::from_secs(1));
        handle.close().await;
        assert!(handle.is_closed());
        let res = handle.call(async { Ok(1) }).await;
        assert!(matches!(res, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_close_stops_background_tasks() {
        let handle = Handle::new(Duration::from_secs(1));
        let token = handle.child_token();
        let seen = token.clone();
        handle.spawn(async move {
            token.cancelled().await;
        });
        handle.close().await;
        assert!(seen.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellable() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = cancellable(&cancel, std::future::pending::<Result<()>>()).await;
        assert!(matches!(res, Err(StoreError::Cancelled)));
    }
}
