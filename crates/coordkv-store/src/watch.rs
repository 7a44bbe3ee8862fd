//! Watch bridge: turns backend-native change notification into the uniform
//! snapshot stream.
//!
//! Each adapter supplies a [`WatchSource`]. The bridge emits the initial
//! snapshot, then every state the source reports, suppressing consecutive
//! duplicates. Transient failures pause the loop with exponential backoff
//! and force a fresh snapshot before resuming, so a change committed during
//! an outage is still observed. Cancellation and handle close end the
//! stream.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::Backoff;
use crate::error::Result;
use crate::handle::Handle;

/// Capacity of the channel between the bridge task and the consumer. A full
/// channel blocks the bridge; events are never dropped.
pub const WATCH_BUFFER: usize = 16;

/// Backend-specific producer of watch states.
#[async_trait]
pub trait WatchSource: Send + 'static {
    /// State delivered to the consumer.
    type Item: Clone + PartialEq + Send + 'static;

    /// Reads the full current state and arms change detection from it.
    async fn snapshot(&mut self) -> Result<Self::Item>;

    /// Waits for the backend to report the next state after the last one
    /// returned by `snapshot` or `next`.
    async fn next(&mut self) -> Result<Self::Item>;
}

/// Takes the initial snapshot and spawns the bridge loop on the handle.
///
/// Errors from the initial snapshot are returned to the caller, so a watch
/// on a missing key fails with `NotFound` up front.
pub async fn spawn_watch<S>(
    handle: &Handle,
    mut source: S,
    cancel: CancellationToken,
    scope: String,
) -> Result<mpsc::Receiver<S::Item>>
where
    S: WatchSource,
{
    let first = handle.call_untimed(source.snapshot()).await?;
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let closed = handle.child_token();
    handle.spawn(run_bridge(source, tx, cancel, closed, scope, first));
    Ok(rx)
}

async fn run_bridge<S>(
    mut source: S,
    tx: mpsc::Sender<S::Item>,
    cancel: CancellationToken,
    closed: CancellationToken,
    scope: String,
    first: S::Item,
) where
    S: WatchSource,
{
    let mut last = first.clone();
    if !emit(&tx, &cancel, &closed, first).await {
        return;
    }

    let mut backoff = Backoff::default();
    let mut resync = false;

    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = closed.cancelled() => break,
            res = async {
                if resync {
                    source.snapshot().await
                } else {
                    source.next().await
                }
            } => res,
        };

        match res {
            Ok(item) => {
                backoff.reset();
                resync = false;
                if item == last {
                    continue;
                }
                last = item.clone();
                if !emit(&tx, &cancel, &closed, item).await {
                    break;
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(scope = %scope, "watched key removed, ending watch");
                break;
            }
            Err(e) if e.is_transient() => {
                let delay = backoff.next_delay();
                warn!(
                    scope = %scope,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "watch interrupted, re-arming after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = closed.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                resync = true;
            }
            Err(e) => {
                error!(scope = %scope, error = %e, "watch terminated");
                break;
            }
        }
    }
    debug!(scope = %scope, "watch stream closed");
}

async fn emit<T>(
    tx: &mpsc::Sender<T>,
    cancel: &CancellationToken,
    closed: &CancellationToken,
    item: T,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = closed.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted source: `next` pops results, then blocks forever.
    struct Scripted {
        snapshot: u64,
        script: VecDeque<Result<u64>>,
        snapshots_taken: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl WatchSource for Scripted {
        type Item = u64;

        async fn snapshot(&mut self) -> Result<u64> {
            self.snapshots_taken
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.snapshot)
        }

        async fn next(&mut self) -> Result<u64> {
            match self.script.pop_front() {
                Some(Ok(v)) => {
                    self.snapshot = v;
                    Ok(v)
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }
    }

    fn scripted(snapshot: u64, script: Vec<Result<u64>>) -> Scripted {
        Scripted {
            snapshot,
            script: script.into(),
            snapshots_taken: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_initial_then_changes_deduplicated() {
        let handle = Handle::new(Duration::from_secs(1));
        let source = scripted(1, vec![Ok(2), Ok(2), Ok(3)]);
        let mut rx = spawn_watch(&handle, source, CancellationToken::new(), "k".into())
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        handle.close().await;
    }

    #[tokio::test]
    async fn test_transient_error_resnapshots() {
        let handle = Handle::new(Duration::from_secs(1));
        let source = scripted(
            1,
            vec![Err(StoreError::Unreachable("500".into())), Ok(5)],
        );
        let taken = source.snapshots_taken.clone();
        let mut rx = spawn_watch(&handle, source, CancellationToken::new(), "k".into())
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(5));
        assert!(taken.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_not_found_ends_stream() {
        let handle = Handle::new(Duration::from_secs(1));
        let source = scripted(1, vec![Err(StoreError::not_found("k"))]);
        let mut rx = spawn_watch(&handle, source, CancellationToken::new(), "k".into())
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let handle = Handle::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let mut rx = spawn_watch(&handle, scripted(1, vec![]), cancel.clone(), "k".into())
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(1));
        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(end.unwrap(), None);
    }
}
