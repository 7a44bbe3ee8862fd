//! Discovery over a coordkv store.
//!
//! Each node writes `<prefix>/<addr>` with value `addr` and a ttl of three
//! heartbeats, re-writing it every heartbeat. Watchers follow the prefix
//! with `watch_tree`, or poll `list` on stores without watches.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use coordkv_store::backoff::{Backoff, BackoffConfig};
use coordkv_store::handle::sleep_or_cancel;
use coordkv_store::{keys, KvPair, Store, StoreError, WriteOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::discovery::{Discoverer, DiscoveryOptions, MEMBERSHIP_BUFFER};
use crate::entry::{same_members, Endpoint};
use crate::error::{DiscoveryError, Result};
use crate::health::{Health, HealthBit};

struct Registration {
    addr: String,
    key: String,
    stop: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
}

/// Store-backed discovery.
pub struct KvDiscovery {
    store: Arc<dyn Store>,
    prefix: String,
    poll_interval: Duration,
    options: DiscoveryOptions,
    health: Arc<HealthBit>,
    registration: Mutex<Option<Registration>>,
    tasks: TaskTracker,
    closed: CancellationToken,
}

impl KvDiscovery {
    /// Builds discovery over `store`, with entries under `prefix`.
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>, options: &DiscoveryOptions) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            poll_interval: options.heartbeat,
            options: options.clone(),
            health: Arc::new(HealthBit::new()),
            registration: Mutex::new(None),
            tasks: TaskTracker::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Key prefix entries live under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(DiscoveryError::Closed);
        }
        Ok(())
    }

    fn registration(&self) -> MutexGuard<'_, Option<Registration>> {
        match self.registration.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_heartbeat(
        &self,
        key: String,
        addr: String,
        heartbeat: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let health = self.health.clone();
        let write = WriteOptions::with_ttl(self.options.entry_ttl(heartbeat));
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires at once; registration already wrote.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.put(&key, addr.as_bytes(), &write).await {
                    Ok(()) => health.record_ok(),
                    Err(StoreError::Closed) => break,
                    Err(e) => {
                        warn!(key = %key, error = %e, "discovery heartbeat failed");
                        health.record_error(&e);
                    }
                }
            }
            debug!(key = %key, "heartbeat stopped");
        })
    }
}

/// Turns listed pairs into sorted endpoints. Values carry the address; the
/// key leaf is used when a value is empty or malformed.
fn endpoints_of(pairs: &[KvPair]) -> Vec<Endpoint> {
    let mut out: Vec<Endpoint> = pairs
        .iter()
        .filter_map(|pair| {
            let from_value = pair.value_str().and_then(|v| Endpoint::parse(v).ok());
            from_value
                .or_else(|| Endpoint::parse(keys::split(&pair.key).1).ok())
                .or_else(|| {
                    debug!(key = %pair.key, "skipping malformed discovery entry");
                    None
                })
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

async fn list_members(store: &dyn Store, prefix: &str) -> std::result::Result<Vec<Endpoint>, StoreError> {
    match store.list(prefix).await {
        Ok(pairs) => Ok(endpoints_of(&pairs)),
        Err(StoreError::NotFound { .. }) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Sends `members` unless it repeats the last emission. Returns false once
/// the consumer is gone or `cancel` fires.
async fn emit(
    tx: &mpsc::Sender<Vec<Endpoint>>,
    last: &mut Option<Vec<Endpoint>>,
    members: Vec<Endpoint>,
    cancel: &CancellationToken,
) -> bool {
    if let Some(previous) = last.as_ref() {
        if same_members(previous, &members) {
            return true;
        }
    }
    *last = Some(members.clone());
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(members) => sent.is_ok(),
    }
}

/// Follows the prefix with tree watches, re-watching when a stream ends.
async fn follow_tree(
    store: Arc<dyn Store>,
    prefix: String,
    first: coordkv_store::TreeWatchStream,
    tx: mpsc::Sender<Vec<Endpoint>>,
    cancel: CancellationToken,
    health: Arc<HealthBit>,
) {
    let mut stream = first;
    let mut last = None;
    let mut backoff = Backoff::new(BackoffConfig::default());
    loop {
        while let Some(pairs) = stream.recv().await {
            health.record_ok();
            if !emit(&tx, &mut last, endpoints_of(&pairs), &cancel).await {
                return;
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        loop {
            match store.watch_tree(&prefix, cancel.child_token()).await {
                Ok(next) => {
                    backoff.reset();
                    stream = next;
                    break;
                }
                Err(StoreError::Cancelled) => return,
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!(prefix = %prefix, error = %e, delay_ms = delay.as_millis() as u64, "discovery re-watch failed, retrying");
                    health.record_error(&e);
                    if sleep_or_cancel(&cancel, delay).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!(prefix = %prefix, error = %e, "discovery watch ended");
                    health.record_error(&e);
                    return;
                }
            }
        }
    }
}

/// Polls `list` for stores without watches.
async fn poll_members(
    store: Arc<dyn Store>,
    prefix: String,
    interval: Duration,
    tx: mpsc::Sender<Vec<Endpoint>>,
    cancel: CancellationToken,
    health: Arc<HealthBit>,
) {
    let mut last = None;
    loop {
        match list_members(store.as_ref(), &prefix).await {
            Ok(members) => {
                health.record_ok();
                if !emit(&tx, &mut last, members, &cancel).await {
                    return;
                }
            }
            Err(StoreError::Closed) | Err(StoreError::Cancelled) => return,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "discovery poll failed");
                health.record_error(&e);
            }
        }
        if sleep_or_cancel(&cancel, interval).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Discoverer for KvDiscovery {
    fn kind(&self) -> &'static str {
        self.store.backend().as_str()
    }

    async fn register(&self, addr: &str, heartbeat: Duration) -> Result<()> {
        self.check_open()?;
        self.store
            .capabilities()
            .require_ttl(self.store.backend())?;
        Endpoint::parse(addr)?;
        let key = keys::join(&self.prefix, addr);
        let stop = self.closed.child_token();
        {
            let mut registration = self.registration();
            if let Some(existing) = registration.as_ref() {
                return Err(DiscoveryError::AlreadyRegistered(existing.addr.clone()));
            }
            *registration = Some(Registration {
                addr: addr.to_string(),
                key: key.clone(),
                stop: stop.clone(),
                heartbeat: None,
            });
        }

        let write = WriteOptions::with_ttl(self.options.entry_ttl(heartbeat));
        if let Err(e) = self.store.put(&key, addr.as_bytes(), &write).await {
            self.registration().take();
            return Err(e.into());
        }
        info!(key = %key, heartbeat_ms = heartbeat.as_millis() as u64, "registered with discovery");
        let task = self.spawn_heartbeat(key, addr.to_string(), heartbeat, stop);
        if let Some(registration) = self.registration().as_mut() {
            registration.heartbeat = Some(task);
        }
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        let Some(registration) = self.registration().take() else {
            return Ok(());
        };
        registration.stop.cancel();
        // A heartbeat write still in flight would recreate the entry.
        if let Some(task) = registration.heartbeat {
            let _ = task.await;
        }
        match self.store.delete(&registration.key).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => {
                info!(key = %registration.key, "deregistered from discovery");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self) -> Result<Vec<Endpoint>> {
        self.check_open()?;
        Ok(list_members(self.store.as_ref(), &self.prefix).await?)
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<Endpoint>>> {
        self.check_open()?;
        let (tx, rx) = mpsc::channel(MEMBERSHIP_BUFFER);
        let cancel = {
            let merged = self.closed.child_token();
            let outer = cancel.clone();
            let inner = merged.clone();
            self.tasks.spawn(async move {
                tokio::select! {
                    _ = outer.cancelled() => inner.cancel(),
                    _ = inner.cancelled() => {}
                }
            });
            merged
        };

        if self.store.capabilities().supports_watch {
            let first = match self.store.watch_tree(&self.prefix, cancel.child_token()).await {
                Ok(first) => first,
                Err(e) => {
                    cancel.cancel();
                    return Err(e.into());
                }
            };
            self.tasks.spawn(follow_tree(
                self.store.clone(),
                self.prefix.clone(),
                first,
                tx,
                cancel,
                self.health.clone(),
            ));
        } else {
            debug!(prefix = %self.prefix, "store has no watches, polling");
            self.tasks.spawn(poll_members(
                self.store.clone(),
                self.prefix.clone(),
                self.poll_interval,
                tx,
                cancel,
                self.health.clone(),
            ));
        }
        Ok(rx)
    }

    fn health(&self) -> Health {
        self.health.snapshot()
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.registration().take();
        self.tasks.close();
        self.tasks.wait().await;
        self.store.close().await;
    }
}

impl std::fmt::Debug for KvDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvDiscovery")
            .field("backend", &self.store.backend())
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordkv_store::backends::boltdb::EmbeddedStore;
    use coordkv_store::backends::etcd::sim::SimEtcd;
    use coordkv_store::backends::etcd::EtcdStore;
    use coordkv_store::config::{OPT_MIN_TTL, OPT_WATCH_WAIT};
    use coordkv_store::StoreConfig;

    fn config() -> StoreConfig {
        StoreConfig::default()
            .with_timeout(Duration::from_secs(2))
            .with_option(OPT_WATCH_WAIT, "0.2")
            .with_option(OPT_MIN_TTL, "0.2")
            .with_bucket("discovery")
    }

    fn etcd(sim: &Arc<SimEtcd>) -> KvDiscovery {
        let store = EtcdStore::new(sim.clone(), &config()).unwrap();
        KvDiscovery::new(Arc::new(store), "swarm/discovery", &DiscoveryOptions::default())
    }

    #[test]
    fn test_endpoints_of_falls_back_to_key() {
        let pairs = vec![
            KvPair::new("d/b:2", b"b:2".to_vec(), 1),
            KvPair::new("d/a:1", Vec::new(), 2),
            KvPair::new("d/garbage", b"not an endpoint".to_vec(), 3),
        ];
        assert_eq!(
            endpoints_of(&pairs),
            vec![Endpoint::new("a", "1"), Endpoint::new("b", "2")]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_and_fetch() {
        let sim = SimEtcd::new();
        let d = etcd(&sim);
        assert!(d.fetch().await.unwrap().is_empty());

        d.register("10.0.0.1:2375", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(
            d.fetch().await.unwrap(),
            vec![Endpoint::new("10.0.0.1", "2375")]
        );
        assert!(matches!(
            d.register("10.0.0.1:2375", Duration::from_millis(200)).await,
            Err(DiscoveryError::AlreadyRegistered(_))
        ));
        d.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_keeps_entry_alive() {
        let sim = SimEtcd::new();
        let d = etcd(&sim);
        let other = etcd(&sim);
        d.register("n1:1", Duration::from_millis(200)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(other.fetch().await.unwrap(), vec![Endpoint::new("n1", "1")]);
        assert!(d.health().ok);

        d.deregister().await.unwrap();
        assert!(other.fetch().await.unwrap().is_empty());
        d.deregister().await.unwrap();
        d.close().await;
        other.close().await;
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let sim = SimEtcd::new();
        let d = etcd(&sim);
        assert!(matches!(
            d.register("no-port", Duration::from_secs(1)).await,
            Err(DiscoveryError::InvalidEndpoint { .. })
        ));
        d.close().await;
    }

    #[tokio::test]
    async fn test_embedded_rejects_registration_and_polls() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("d.db"), &config()).unwrap();
        let store: Arc<dyn Store> = Arc::new(store);
        store
            .put("discovery/a:1", b"a:1", &WriteOptions::default())
            .await
            .unwrap();
        let options = DiscoveryOptions::default().with_heartbeat(Duration::from_millis(50));
        let d = KvDiscovery::new(store.clone(), "discovery", &options);

        let err = d.register("b:2", Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_not_supported(), "{}", err);

        let mut rx = d.watch(CancellationToken::new()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![Endpoint::new("a", "1")]);
        store
            .put("discovery/b:2", b"b:2", &WriteOptions::default())
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, vec![Endpoint::new("a", "1"), Endpoint::new("b", "2")]);
        d.close().await;
        assert!(matches!(d.fetch().await, Err(DiscoveryError::Closed)));
    }
}
