//! Shared fixtures for discovery integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coordkv_discovery::DiscoveryOptions;
use coordkv_store::backends::etcd::sim::SimEtcd;
use coordkv_store::backends::etcd::EtcdStore;
use coordkv_store::backends::zookeeper;
use coordkv_store::backends::zookeeper::sim::SimZk;
use coordkv_store::config::{OPT_MIN_TTL, OPT_WATCH_WAIT};
use coordkv_store::{Registry, Store, StoreConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("coordkv_discovery=debug,coordkv_store=info")
        .try_init();
}

pub fn store_config() -> StoreConfig {
    StoreConfig::default()
        .with_timeout(Duration::from_secs(2))
        .with_option(OPT_WATCH_WAIT, "0.2")
        .with_option(OPT_MIN_TTL, "0.2")
}

/// Fast heartbeats so ttl expiry is observable within a test.
pub fn options() -> DiscoveryOptions {
    DiscoveryOptions::default()
        .with_heartbeat(Duration::from_millis(200))
        .with_store(store_config())
}

/// Registry whose `zk` tag connects to `zk`.
pub fn zk_registry(zk: &Arc<SimZk>) -> Registry {
    let registry = Registry::with_defaults();
    zookeeper::register(&registry, zk.connector());
    registry
}

/// Registry whose `etcd` tag opens handles onto `sim`, ignoring endpoints.
pub fn etcd_registry(sim: &Arc<SimEtcd>) -> Registry {
    let registry = Registry::with_defaults();
    let sim = sim.clone();
    registry.register("etcd", move |_endpoints, config| {
        Ok(Arc::new(EtcdStore::new(sim.clone(), &config)?) as Arc<dyn Store>)
    });
    registry
}

/// Minimal stand-in for the hosted discovery service. POST adds the body
/// to the member set, GET returns it as a JSON array.
pub struct FakeHub {
    pub url: String,
    members: Arc<Mutex<BTreeSet<String>>>,
    posts: Arc<AtomicUsize>,
}

impl FakeHub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let members = Arc::new(Mutex::new(BTreeSet::new()));
        let posts = Arc::new(AtomicUsize::new(0));
        {
            let members = members.clone();
            let posts = posts.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve(socket, members.clone(), posts.clone()));
                }
            });
        }
        Self {
            url: format!("http://{}/v1", addr),
            members,
            posts,
        }
    }

    pub fn add(&self, member: &str) {
        self.members.lock().unwrap().insert(member.to_string());
    }

    pub fn remove(&self, member: &str) {
        self.members.lock().unwrap().remove(member);
    }

    pub fn members(&self) -> Vec<String> {
        self.members.lock().unwrap().iter().cloned().collect()
    }

    pub fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

async fn serve(
    mut socket: TcpStream,
    members: Arc<Mutex<BTreeSet<String>>>,
    posts: Arc<AtomicUsize>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let end = loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = header_end(&buf) {
            break end;
        }
    };
    let head = String::from_utf8_lossy(&buf[..end]).to_string();
    let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < end + length {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[end..end + length]).to_string();

    let request_line = head.lines().next().unwrap_or("");
    let (status, payload) = if !request_line.contains("/v1/clusters/") {
        ("404 Not Found", String::new())
    } else if request_line.starts_with("POST ") {
        members.lock().unwrap().insert(body);
        posts.fetch_add(1, Ordering::SeqCst);
        ("200 OK", String::new())
    } else if request_line.starts_with("GET ") {
        let listed: Vec<String> = members.lock().unwrap().iter().cloned().collect();
        ("200 OK", serde_json::to_string(&listed).unwrap())
    } else {
        ("405 Method Not Allowed", String::new())
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}
