//! etcd v2 keys API over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::client::{
    DeleteRequest, EtcdClient, EtcdError, EtcdEvent, EtcdNode, EtcdResponse, SetRequest,
};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::http::{HttpPool, HttpRequest};

const INDEX_HEADER: &str = "X-Etcd-Index";

#[derive(Debug, Deserialize)]
struct WireNode {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<WireNode>,
    #[serde(default, rename = "modifiedIndex")]
    modified_index: u64,
    #[serde(default, rename = "createdIndex")]
    created_index: u64,
    #[serde(default)]
    ttl: Option<i64>,
}

impl From<WireNode> for EtcdNode {
    fn from(wire: WireNode) -> Self {
        EtcdNode {
            key: wire.key,
            value: wire.value.map(String::into_bytes).unwrap_or_default(),
            dir: wire.dir,
            nodes: wire.nodes.into_iter().map(EtcdNode::from).collect(),
            modified_index: wire.modified_index,
            created_index: wire.created_index,
            ttl: wire
                .ttl
                .filter(|t| *t > 0)
                .map(|t| Duration::from_secs(t as u64)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    action: String,
    node: Option<WireNode>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    index: u64,
}

/// etcd v2 client speaking HTTP/JSON to one or more members.
#[derive(Debug)]
pub struct HttpEtcdClient {
    pool: HttpPool,
}

impl HttpEtcdClient {
    /// Creates a client for `endpoints` (`host:port`).
    pub fn new(endpoints: &[String], config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            pool: HttpPool::new(endpoints, config)?,
        })
    }

    async fn call(&self, request: HttpRequest) -> std::result::Result<(WireResponse, u64), EtcdError> {
        self.exchange(request)
            .await?
            .ok_or_else(|| EtcdError::Unavailable("request timed out".into()))
    }

    /// Sends a request and decodes the reply. `Ok(None)` means the
    /// request's timeout elapsed, which long polls treat as "no change".
    async fn exchange(
        &self,
        request: HttpRequest,
    ) -> std::result::Result<Option<(WireResponse, u64)>, EtcdError> {
        let response = match self.pool.send(&request).await {
            Ok(response) => response,
            Err(StoreError::Timeout(_)) => return Ok(None),
            Err(e) => return Err(transport_error(e)),
        };
        let status = response.status();
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        // Long polls send headers right away; the body carries the event.
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Ok(None),
            Err(e) => return Err(EtcdError::Unavailable(e.to_string())),
        };

        if status.is_success() {
            let parsed: WireResponse = serde_json::from_slice(&body)
                .map_err(|e| EtcdError::Protocol(format!("bad response body: {}", e)))?;
            return Ok(Some((parsed, index)));
        }

        if let Ok(err) = serde_json::from_slice::<WireError>(&body) {
            return Err(EtcdError::api(err.error_code, err.message, err.index));
        }
        let text = String::from_utf8_lossy(&body);
        if status.is_server_error() {
            Err(EtcdError::Unavailable(format!("HTTP {}: {}", status, text.trim())))
        } else {
            Err(EtcdError::Protocol(format!("HTTP {}: {}", status, text.trim())))
        }
    }
}

fn transport_error(e: StoreError) -> EtcdError {
    match e {
        StoreError::Unreachable(msg) => EtcdError::Unavailable(msg),
        StoreError::Timeout(t) => EtcdError::Unavailable(format!("timed out after {:?}", t)),
        other => EtcdError::Protocol(other.to_string()),
    }
}

fn keys_path(key: &str) -> String {
    format!("/v2/keys{}", key)
}

/// etcd v2 ttls are whole seconds; round up so a short ttl never becomes
/// "no ttl".
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

fn node_of(response: WireResponse) -> std::result::Result<EtcdNode, EtcdError> {
    response
        .node
        .map(EtcdNode::from)
        .ok_or_else(|| EtcdError::Protocol("response without node".into()))
}

#[async_trait]
impl EtcdClient for HttpEtcdClient {
    async fn get(&self, key: &str, recursive: bool) -> std::result::Result<EtcdResponse, EtcdError> {
        let request = HttpRequest::get(keys_path(key))
            .query("recursive", recursive)
            .query("sorted", true);
        let (response, index) = self.call(request).await?;
        Ok(EtcdResponse {
            node: node_of(response)?,
            index,
        })
    }

    async fn set(&self, key: &str, request: SetRequest) -> std::result::Result<EtcdNode, EtcdError> {
        let mut http = HttpRequest::put(keys_path(key));
        if request.dir {
            http = http.query("dir", true);
        } else if !request.refresh {
            let value = String::from_utf8(request.value).map_err(|_| {
                EtcdError::Protocol("etcd v2 values must be valid UTF-8".into())
            })?;
            http = http.query("value", value);
        }
        let http = http
            .query_opt("ttl", request.ttl.map(ttl_secs))
            .query_opt("prevExist", request.prev_exist)
            .query_opt("prevIndex", request.prev_index)
            .query_opt("refresh", request.refresh.then_some(true));
        let (response, _) = self.call(http).await?;
        node_of(response)
    }

    async fn delete(
        &self,
        key: &str,
        request: DeleteRequest,
    ) -> std::result::Result<EtcdNode, EtcdError> {
        let http = HttpRequest::delete(keys_path(key))
            .query_opt("recursive", request.recursive.then_some(true))
            .query_opt("dir", request.dir.then_some(true))
            .query_opt("prevIndex", request.prev_index);
        let (response, _) = self.call(http).await?;
        node_of(response)
    }

    async fn wait(
        &self,
        key: &str,
        recursive: bool,
        wait_index: u64,
        wait: Duration,
    ) -> std::result::Result<Option<EtcdEvent>, EtcdError> {
        let request = HttpRequest::get(keys_path(key))
            .query("wait", true)
            .query("waitIndex", wait_index)
            .query("recursive", recursive)
            .timeout(wait);
        let (response, _) = match self.exchange(request).await? {
            Some(reply) => reply,
            None => return Ok(None),
        };
        let action = response.action.clone();
        Ok(Some(EtcdEvent {
            action,
            node: node_of(response)?,
        }))
    }
}
