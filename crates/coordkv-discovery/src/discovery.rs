//! Discovery façade.
//!
//! [`Discovery::open`] parses a discovery URI and picks a [`Discoverer`]:
//! a store-backed one for `etcd`, `consul`, `zk` and `file` URIs, a fixed
//! list for `nodes`, or the hosted service for `token`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordkv_store::{default_registry, Registry, StoreConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::entry::{diff, Endpoint};
use crate::error::Result;
use crate::health::Health;
use crate::kv::KvDiscovery;
use crate::nodes::NodesDiscovery;
use crate::token::TokenDiscovery;
use crate::uri::{self, DiscoveryTarget, DEFAULT_BUCKET};

/// Capacity of membership channels.
pub const MEMBERSHIP_BUFFER: usize = 16;

/// Default hosted discovery endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://discovery.hub.docker.com/v1";

/// Configuration for a discovery handle.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Heartbeat and poll interval (default: 20s).
    pub heartbeat: Duration,
    /// Entry ttl; `None` means three heartbeats.
    pub ttl: Option<Duration>,
    /// Config handed to the store backend.
    pub store: StoreConfig,
    /// Base URL of the hosted discovery service.
    pub token_url: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(20),
            ttl: None,
            store: StoreConfig::default(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }
}

impl DiscoveryOptions {
    /// Sets the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the store config.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets the hosted discovery base URL.
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// Entry ttl for a given heartbeat.
    pub fn entry_ttl(&self, heartbeat: Duration) -> Duration {
        self.ttl.unwrap_or(heartbeat * 3)
    }
}

/// A source of cluster membership.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Short name of the discovery backend.
    fn kind(&self) -> &'static str;

    /// Registers this node once and keeps the entry alive every `heartbeat`.
    async fn register(&self, addr: &str, heartbeat: Duration) -> Result<()>;

    /// Stops the heartbeat and removes this node's entry.
    async fn deregister(&self) -> Result<()>;

    /// Current members.
    async fn fetch(&self) -> Result<Vec<Endpoint>>;

    /// Emits the member set now and after every change until `cancel`
    /// fires or the handle closes.
    async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<Endpoint>>>;

    /// Health of the background loops.
    fn health(&self) -> Health;

    /// Stops background loops and releases the backend.
    async fn close(&self);
}

/// One membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    /// Full member set after the change.
    pub members: Vec<Endpoint>,
    /// Members that joined.
    pub added: Vec<Endpoint>,
    /// Members that left.
    pub removed: Vec<Endpoint>,
}

/// Discovery handle built from a URI.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<dyn Discoverer>,
    uri: String,
}

impl Discovery {
    /// Opens `uri` with the process default registry.
    pub fn open(uri: &str, options: DiscoveryOptions) -> Result<Self> {
        Self::open_with(default_registry(), uri, options)
    }

    /// Opens `uri`, building stores from `registry`.
    pub fn open_with(registry: &Registry, uri: &str, options: DiscoveryOptions) -> Result<Self> {
        let inner: Arc<dyn Discoverer> = match uri::parse(uri)? {
            DiscoveryTarget::Nodes(entries) => Arc::new(NodesDiscovery::new(&entries)?),
            DiscoveryTarget::Token(token) => {
                Arc::new(TokenDiscovery::new(&options.token_url, &token, &options)?)
            }
            DiscoveryTarget::Store {
                tag,
                addresses,
                prefix,
            } => {
                let mut config = options.store.clone();
                if config.bucket.is_none() {
                    config.bucket = Some(DEFAULT_BUCKET.to_string());
                }
                let store = registry.new_store(&tag, addresses, config)?;
                Arc::new(KvDiscovery::new(store, prefix, &options))
            }
        };
        debug!(uri = %uri, kind = inner.kind(), "opened discovery");
        Ok(Self {
            inner,
            uri: uri.to_string(),
        })
    }

    /// Wraps an existing discoverer.
    pub fn from_discoverer(inner: Arc<dyn Discoverer>, uri: impl Into<String>) -> Self {
        Self {
            inner,
            uri: uri.into(),
        }
    }

    /// URI the handle was opened with.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Backend name.
    pub fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    /// See [`Discoverer::register`].
    pub async fn register(&self, addr: &str, heartbeat: Duration) -> Result<()> {
        self.inner.register(addr, heartbeat).await
    }

    /// See [`Discoverer::deregister`].
    pub async fn deregister(&self) -> Result<()> {
        self.inner.deregister().await
    }

    /// See [`Discoverer::fetch`].
    pub async fn fetch(&self) -> Result<Vec<Endpoint>> {
        self.inner.fetch().await
    }

    /// See [`Discoverer::watch`].
    pub async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<Endpoint>>> {
        self.inner.watch(cancel).await
    }

    /// Watches membership and reports what changed against the previous
    /// set. The first item lists every member as added.
    pub async fn watch_changes(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<MembershipChange>> {
        let mut members = self.inner.watch(cancel.clone()).await?;
        let (tx, rx) = mpsc::channel(MEMBERSHIP_BUFFER);
        tokio::spawn(async move {
            let mut previous: Vec<Endpoint> = Vec::new();
            while let Some(current) = members.recv().await {
                let (added, removed) = diff(&previous, &current);
                let change = MembershipChange {
                    members: current.clone(),
                    added,
                    removed,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(change) => if sent.is_err() { break },
                }
                previous = current;
            }
        });
        Ok(rx)
    }

    /// See [`Discoverer::health`].
    pub fn health(&self) -> Health {
        self.inner.health()
    }

    /// See [`Discoverer::close`].
    pub async fn close(&self) {
        self.inner.close().await
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("uri", &self.uri)
            .field("kind", &self.inner.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;

    #[test]
    fn test_options_defaults() {
        let options = DiscoveryOptions::default();
        assert_eq!(options.heartbeat, Duration::from_secs(20));
        assert_eq!(
            options.entry_ttl(Duration::from_secs(5)),
            Duration::from_secs(15)
        );
        let pinned = DiscoveryOptions {
            ttl: Some(Duration::from_secs(7)),
            ..DiscoveryOptions::default()
        };
        assert_eq!(pinned.entry_ttl(Duration::from_secs(5)), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_open_static_list() {
        let discovery = Discovery::open("a:1,b:2", DiscoveryOptions::default()).unwrap();
        assert_eq!(discovery.kind(), "nodes");
        assert_eq!(
            discovery.fetch().await.unwrap(),
            vec![Endpoint::new("a", "1"), Endpoint::new("b", "2")]
        );
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let err = Discovery::open("redis://h:1/x", DiscoveryOptions::default()).unwrap_err();
        assert!(err.is_not_supported(), "{}", err);
    }

    #[tokio::test]
    async fn test_watch_changes_reports_diffs() {
        let discovery = Discovery::open("nodes://a:1", DiscoveryOptions::default()).unwrap();
        let cancel = CancellationToken::new();
        let mut changes = discovery.watch_changes(cancel.clone()).await.unwrap();
        let first = changes.recv().await.unwrap();
        assert_eq!(first.added, vec![Endpoint::new("a", "1")]);
        assert!(first.removed.is_empty());
        cancel.cancel();
        assert!(changes.recv().await.is_none());
    }

    #[test]
    fn test_bad_uri() {
        assert!(matches!(
            Discovery::open("token://", DiscoveryOptions::default()),
            Err(DiscoveryError::InvalidUri { .. })
        ));
    }
}
