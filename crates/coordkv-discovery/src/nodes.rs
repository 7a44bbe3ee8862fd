//! Fixed member list from `nodes://` URIs.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::discovery::{Discoverer, MEMBERSHIP_BUFFER};
use crate::entry::{parse_entries, Endpoint};
use crate::error::{DiscoveryError, Result};
use crate::health::Health;

/// Discovery over a list given up front. Registration is a no-op.
#[derive(Debug)]
pub struct NodesDiscovery {
    members: Vec<Endpoint>,
    closed: CancellationToken,
}

impl NodesDiscovery {
    /// Builds the list, expanding `host[1:3]:port` ranges.
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        Ok(Self {
            members: parse_entries(entries)?,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Discoverer for NodesDiscovery {
    fn kind(&self) -> &'static str {
        "nodes"
    }

    async fn register(&self, addr: &str, _heartbeat: Duration) -> Result<()> {
        debug!(addr = %addr, "static node list ignores registration");
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Endpoint>> {
        if self.closed.is_cancelled() {
            return Err(DiscoveryError::Closed);
        }
        Ok(self.members.clone())
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<Endpoint>>> {
        let members = self.fetch().await?;
        let (tx, rx) = mpsc::channel(MEMBERSHIP_BUFFER);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            if tx.send(members).await.is_err() {
                return;
            }
            // The list never changes; hold the channel open until asked to stop.
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = closed.cancelled() => {}
                _ = tx.closed() => {}
            }
        });
        Ok(rx)
    }

    fn health(&self) -> Health {
        Health::default()
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
