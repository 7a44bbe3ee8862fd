//! Shared fixtures: one in-process cluster per backend, any number of
//! handles onto it.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordkv_store::backends::boltdb::EmbeddedStore;
use coordkv_store::backends::consul::sim::SimConsul;
use coordkv_store::backends::consul::ConsulStore;
use coordkv_store::backends::etcd::client::{
    DeleteRequest, EtcdClient, EtcdError, EtcdEvent, EtcdNode, EtcdResponse, SetRequest,
};
use coordkv_store::backends::etcd::sim::SimEtcd;
use coordkv_store::backends::etcd::EtcdStore;
use coordkv_store::backends::zookeeper::sim::SimZk;
use coordkv_store::backends::zookeeper::ZkStore;
use coordkv_store::config::{OPT_MIN_TTL, OPT_WATCH_WAIT};
use coordkv_store::{Store, StoreConfig};
use tempfile::TempDir;

/// Routes store logs to the test writer; repeated calls are harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("coordkv_store=debug")
        .try_init();
}

/// Config used by every fixture: short call timeout and long polls, and
/// simulator ttls allowed below the production minimum.
pub fn test_config() -> StoreConfig {
    StoreConfig::default()
        .with_timeout(Duration::from_secs(2))
        .with_option(OPT_WATCH_WAIT, "0.2")
        .with_option(OPT_MIN_TTL, "0.2")
        .with_bucket("coordkv-test")
}

/// One simulated backend.
pub enum Cluster {
    Embedded(TempDir),
    Etcd(Arc<SimEtcd>),
    Consul(Arc<SimConsul>),
    Zookeeper(Arc<SimZk>),
}

impl Cluster {
    pub fn embedded() -> Self {
        Cluster::Embedded(tempfile::tempdir().expect("tempdir"))
    }

    pub fn etcd() -> Self {
        Cluster::Etcd(SimEtcd::new())
    }

    pub fn consul() -> Self {
        Cluster::Consul(SimConsul::new())
    }

    pub fn zookeeper() -> Self {
        Cluster::Zookeeper(SimZk::new())
    }

    /// Backends with watches, locks and ttls.
    pub fn clustered() -> Vec<Cluster> {
        vec![Cluster::etcd(), Cluster::consul(), Cluster::zookeeper()]
    }

    /// Every backend.
    pub fn all() -> Vec<Cluster> {
        let mut all = vec![Cluster::embedded()];
        all.extend(Cluster::clustered());
        all
    }

    pub fn name(&self) -> &'static str {
        match self {
            Cluster::Embedded(_) => "boltdb",
            Cluster::Etcd(_) => "etcd",
            Cluster::Consul(_) => "consul",
            Cluster::Zookeeper(_) => "zk",
        }
    }

    /// Opens a new handle (and, where the backend has them, a new session).
    pub fn open(&self) -> Arc<dyn Store> {
        let config = test_config();
        match self {
            Cluster::Embedded(dir) => Arc::new(
                EmbeddedStore::open(dir.path().join("store.db"), &config).expect("open embedded"),
            ),
            Cluster::Etcd(sim) => {
                Arc::new(EtcdStore::new(sim.clone(), &config).expect("open etcd"))
            }
            Cluster::Consul(sim) => {
                Arc::new(ConsulStore::new(sim.clone(), &config).expect("open consul"))
            }
            Cluster::Zookeeper(zk) => Arc::new(ZkStore::new(zk.connect(), &config)),
        }
    }
}

/// etcd client whose calls fail with `Unavailable` while tripped, so one
/// handle can be cut off while others keep writing.
pub struct FlakyEtcd {
    inner: Arc<SimEtcd>,
    down: AtomicBool,
}

impl FlakyEtcd {
    pub fn new(inner: Arc<SimEtcd>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            down: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), EtcdError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(EtcdError::Unavailable("500 Internal Server Error".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EtcdClient for FlakyEtcd {
    async fn get(&self, key: &str, recursive: bool) -> Result<EtcdResponse, EtcdError> {
        self.check()?;
        self.inner.get(key, recursive).await
    }

    async fn set(&self, key: &str, request: SetRequest) -> Result<EtcdNode, EtcdError> {
        self.check()?;
        self.inner.set(key, request).await
    }

    async fn delete(&self, key: &str, request: DeleteRequest) -> Result<EtcdNode, EtcdError> {
        self.check()?;
        self.inner.delete(key, request).await
    }

    async fn wait(
        &self,
        key: &str,
        recursive: bool,
        wait_index: u64,
        wait: Duration,
    ) -> Result<Option<EtcdEvent>, EtcdError> {
        self.check()?;
        // A poll already in flight when the outage starts fails as well.
        let polled = self.inner.wait(key, recursive, wait_index, wait).await;
        self.check()?;
        polled
    }
}

/// etcd client whose ttl refreshes commit at once but reply late.
pub struct SlowRefreshEtcd {
    inner: Arc<SimEtcd>,
    delay: Duration,
}

impl SlowRefreshEtcd {
    pub fn new(inner: Arc<SimEtcd>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { inner, delay })
    }
}

#[async_trait]
impl EtcdClient for SlowRefreshEtcd {
    async fn get(&self, key: &str, recursive: bool) -> Result<EtcdResponse, EtcdError> {
        self.inner.get(key, recursive).await
    }

    async fn set(&self, key: &str, request: SetRequest) -> Result<EtcdNode, EtcdError> {
        let refresh = request.refresh;
        let written = self.inner.set(key, request).await;
        if refresh {
            tokio::time::sleep(self.delay).await;
        }
        written
    }

    async fn delete(&self, key: &str, request: DeleteRequest) -> Result<EtcdNode, EtcdError> {
        self.inner.delete(key, request).await
    }

    async fn wait(
        &self,
        key: &str,
        recursive: bool,
        wait_index: u64,
        wait: Duration,
    ) -> Result<Option<EtcdEvent>, EtcdError> {
        self.inner.wait(key, recursive, wait_index, wait).await
    }
}
