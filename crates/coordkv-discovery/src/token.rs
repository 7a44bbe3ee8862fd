//! Hosted discovery from `token://<id>` URIs.
//!
//! Nodes POST their address to `<base>/clusters/<token>?ttl=<secs>` every
//! heartbeat; members are read with a GET returning a JSON array of
//! `host:port` strings. The service has no change feed, so `watch` polls.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::discovery::{Discoverer, DiscoveryOptions, MEMBERSHIP_BUFFER};
use crate::entry::{same_members, Endpoint};
use crate::error::{DiscoveryError, Result};
use crate::health::{Health, HealthBit};

/// Client for one hosted cluster.
#[derive(Debug, Clone)]
struct TokenClient {
    http: Client,
    url: String,
}

impl TokenClient {
    async fn post(&self, addr: &str, ttl: Duration) -> Result<()> {
        self.http
            .post(&self.url)
            .query(&[("ttl", ttl.as_secs().max(1))])
            .body(addr.to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn members(&self) -> Result<Vec<Endpoint>> {
        let entries: Vec<String> = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut members = Vec::with_capacity(entries.len());
        for entry in &entries {
            match Endpoint::parse(entry) {
                Ok(endpoint) => members.push(endpoint),
                Err(e) => debug!(error = %e, "skipping malformed discovery entry"),
            }
        }
        members.sort();
        members.dedup();
        Ok(members)
    }
}

/// Discovery through the hosted token service.
pub struct TokenDiscovery {
    client: TokenClient,
    options: DiscoveryOptions,
    health: Arc<HealthBit>,
    registered: Mutex<Option<(String, CancellationToken)>>,
    tasks: TaskTracker,
    closed: CancellationToken,
}

impl TokenDiscovery {
    /// Builds discovery for cluster `token` at service `base_url`.
    pub fn new(base_url: &str, token: &str, options: &DiscoveryOptions) -> Result<Self> {
        let http = Client::builder()
            .timeout(options.store.connection_timeout())
            .build()?;
        let url = format!("{}/clusters/{}", base_url.trim_end_matches('/'), token);
        Ok(Self {
            client: TokenClient { http, url },
            options: options.clone(),
            health: Arc::new(HealthBit::new()),
            registered: Mutex::new(None),
            tasks: TaskTracker::new(),
            closed: CancellationToken::new(),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(DiscoveryError::Closed);
        }
        Ok(())
    }

    fn registered(&self) -> MutexGuard<'_, Option<(String, CancellationToken)>> {
        match self.registered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Discoverer for TokenDiscovery {
    fn kind(&self) -> &'static str {
        "token"
    }

    async fn register(&self, addr: &str, heartbeat: Duration) -> Result<()> {
        self.check_open()?;
        Endpoint::parse(addr)?;
        let stop = self.closed.child_token();
        {
            let mut registered = self.registered();
            if let Some((existing, _)) = registered.as_ref() {
                return Err(DiscoveryError::AlreadyRegistered(existing.clone()));
            }
            *registered = Some((addr.to_string(), stop.clone()));
        }

        let ttl = self.options.entry_ttl(heartbeat);
        if let Err(e) = self.client.post(addr, ttl).await {
            self.registered().take();
            return Err(e);
        }
        info!(url = %self.client.url, addr = %addr, "registered with hosted discovery");

        let client = self.client.clone();
        let health = self.health.clone();
        let addr = addr.to_string();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match client.post(&addr, ttl).await {
                    Ok(()) => health.record_ok(),
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "discovery heartbeat failed");
                        health.record_error(&e);
                    }
                }
            }
        });
        Ok(())
    }

    /// Stops the heartbeat. The service drops the entry once its ttl runs
    /// out.
    async fn deregister(&self) -> Result<()> {
        if let Some((_, stop)) = self.registered().take() {
            stop.cancel();
        }
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Endpoint>> {
        self.check_open()?;
        self.client.members().await
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<Endpoint>>> {
        self.check_open()?;
        let first = self.client.members().await?;
        let (tx, rx) = mpsc::channel(MEMBERSHIP_BUFFER);
        let client = self.client.clone();
        let health = self.health.clone();
        let interval = self.options.heartbeat;
        let closed = self.closed.clone();
        self.tasks.spawn(async move {
            let mut last = first.clone();
            if tx.send(first).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = closed.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match client.members().await {
                    Ok(members) => {
                        health.record_ok();
                        if same_members(&last, &members) {
                            continue;
                        }
                        last = members.clone();
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = tx.send(members) => if sent.is_err() { break },
                        }
                    }
                    Err(e) => {
                        warn!(url = %client.url, error = %e, "discovery poll failed");
                        health.record_error(&e);
                    }
                }
            }
        });
        Ok(rx)
    }

    fn health(&self) -> Health {
        self.health.snapshot()
    }

    async fn close(&self) {
        self.closed.cancel();
        self.registered().take();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl std::fmt::Debug for TokenDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenDiscovery")
            .field("url", &self.client.url)
            .finish()
    }
}
