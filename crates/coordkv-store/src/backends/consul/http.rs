//! Consul agent HTTP API (`/v1/kv`, `/v1/session`).

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::client::{BlockingQuery, ConsulClient, ConsulError, ConsulPair, KvWrite, SessionSpec};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::http::{HttpPool, HttpRequest};

const INDEX_HEADER: &str = "X-Consul-Index";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WirePair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    flags: u64,
    #[serde(default)]
    create_index: u64,
    #[serde(default)]
    modify_index: u64,
    #[serde(default)]
    lock_index: u64,
    #[serde(default)]
    session: Option<String>,
}

impl WirePair {
    fn decode(self) -> std::result::Result<ConsulPair, ConsulError> {
        let value = match self.value {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| ConsulError::Protocol(format!("bad value encoding: {}", e)))?,
            None => Vec::new(),
        };
        Ok(ConsulPair {
            key: self.key,
            value,
            flags: self.flags,
            create_index: self.create_index,
            modify_index: self.modify_index,
            lock_index: self.lock_index,
            session: self.session.filter(|s| !s.is_empty()),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireSessionSpec<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'static str,
    lock_delay: String,
}

#[derive(Debug, Deserialize)]
struct WireSessionId {
    #[serde(rename = "ID")]
    id: String,
}

/// Consul client speaking to one or more agents.
#[derive(Debug)]
pub struct HttpConsulClient {
    pool: HttpPool,
}

/// Formats a duration the way Consul parses them (`"15s"`, `"250ms"`).
fn go_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn kv_path(key: &str) -> String {
    format!("/v1/kv/{}", key.trim_start_matches('/'))
}

fn blocking(request: HttpRequest, query: Option<BlockingQuery>) -> HttpRequest {
    match query {
        Some(q) => request
            .query("index", q.index)
            .query("wait", go_duration(q.wait))
            // Consul adds up to wait/16 of jitter before answering.
            .timeout(q.wait + q.wait / 16 + Duration::from_secs(1)),
        None => request,
    }
}

fn transport_error(e: StoreError) -> ConsulError {
    match e {
        StoreError::Unreachable(msg) => ConsulError::Unavailable(msg),
        StoreError::Timeout(t) => ConsulError::Unavailable(format!("timed out after {:?}", t)),
        other => ConsulError::Protocol(other.to_string()),
    }
}

fn classify(status: StatusCode, body: &str) -> ConsulError {
    let message = body.trim().to_string();
    if message.contains("invalid session") || message.contains("Session id") {
        return ConsulError::InvalidSession(message);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ConsulError::Unavailable(format!("HTTP {}: {}", status, message))
    } else {
        ConsulError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

struct Reply {
    status: StatusCode,
    index: u64,
    body: Vec<u8>,
}

impl HttpConsulClient {
    /// Creates a client for agents at `endpoints` (`host:port`).
    pub fn new(endpoints: &[String], config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            pool: HttpPool::new(endpoints, config)?,
        })
    }

    async fn exchange(&self, request: HttpRequest) -> std::result::Result<Reply, ConsulError> {
        let response = self.pool.send(&request).await.map_err(transport_error)?;
        let status = response.status();
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let body = response
            .bytes()
            .await
            .map_err(|e| ConsulError::Unavailable(e.to_string()))?
            .to_vec();
        Ok(Reply {
            status,
            index,
            body,
        })
    }

    /// Sends and requires a 2xx answer.
    async fn call(&self, request: HttpRequest) -> std::result::Result<Reply, ConsulError> {
        let reply = self.exchange(request).await?;
        if reply.status.is_success() {
            Ok(reply)
        } else {
            Err(classify(reply.status, &String::from_utf8_lossy(&reply.body)))
        }
    }

    fn decode_pairs(body: &[u8]) -> std::result::Result<Vec<ConsulPair>, ConsulError> {
        let wire: Vec<WirePair> = serde_json::from_slice(body)
            .map_err(|e| ConsulError::Protocol(format!("bad kv body: {}", e)))?;
        wire.into_iter().map(WirePair::decode).collect()
    }

    fn decode_bool(body: &[u8]) -> std::result::Result<bool, ConsulError> {
        serde_json::from_slice(body)
            .map_err(|e| ConsulError::Protocol(format!("expected true/false: {}", e)))
    }
}

#[async_trait]
impl ConsulClient for HttpConsulClient {
    async fn get(
        &self,
        key: &str,
        query: Option<BlockingQuery>,
    ) -> std::result::Result<(Option<ConsulPair>, u64), ConsulError> {
        let reply = self
            .exchange(blocking(HttpRequest::get(kv_path(key)), query))
            .await?;
        if reply.status == StatusCode::NOT_FOUND {
            return Ok((None, reply.index));
        }
        if !reply.status.is_success() {
            return Err(classify(reply.status, &String::from_utf8_lossy(&reply.body)));
        }
        let pair = Self::decode_pairs(&reply.body)?.into_iter().next();
        Ok((pair, reply.index))
    }

    async fn list(
        &self,
        prefix: &str,
        query: Option<BlockingQuery>,
    ) -> std::result::Result<(Vec<ConsulPair>, u64), ConsulError> {
        let request = HttpRequest::get(kv_path(prefix)).query("recurse", true);
        let reply = self.exchange(blocking(request, query)).await?;
        if reply.status == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), reply.index));
        }
        if !reply.status.is_success() {
            return Err(classify(reply.status, &String::from_utf8_lossy(&reply.body)));
        }
        Ok((Self::decode_pairs(&reply.body)?, reply.index))
    }

    async fn put(&self, key: &str, write: KvWrite) -> std::result::Result<bool, ConsulError> {
        let request = HttpRequest::put(kv_path(key))
            .query_opt("cas", write.cas)
            .query_opt("acquire", write.acquire)
            .query_opt("release", write.release)
            .body(write.value);
        let reply = self.call(request).await?;
        Self::decode_bool(&reply.body)
    }

    async fn delete(
        &self,
        key: &str,
        cas: Option<u64>,
        recurse: bool,
    ) -> std::result::Result<bool, ConsulError> {
        let request = HttpRequest::delete(kv_path(key))
            .query_opt("cas", cas)
            .query_opt("recurse", recurse.then_some(true));
        let reply = self.call(request).await?;
        if reply.body.is_empty() {
            return Ok(true);
        }
        Self::decode_bool(&reply.body)
    }

    async fn create_session(&self, spec: &SessionSpec) -> std::result::Result<String, ConsulError> {
        let wire = WireSessionSpec {
            name: &spec.name,
            ttl: go_duration(spec.ttl),
            behavior: spec.behavior.as_str(),
            lock_delay: go_duration(spec.lock_delay),
        };
        let body = serde_json::to_vec(&wire)
            .map_err(|e| ConsulError::Protocol(format!("encoding session: {}", e)))?;
        let reply = self
            .call(HttpRequest::put("/v1/session/create").body(body))
            .await?;
        let created: WireSessionId = serde_json::from_slice(&reply.body)
            .map_err(|e| ConsulError::Protocol(format!("bad session body: {}", e)))?;
        Ok(created.id)
    }

    async fn renew_session(&self, id: &str) -> std::result::Result<(), ConsulError> {
        let reply = self
            .exchange(HttpRequest::put(format!("/v1/session/renew/{}", id)))
            .await?;
        match reply.status {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ConsulError::InvalidSession(id.to_string())),
            status => Err(classify(status, &String::from_utf8_lossy(&reply.body))),
        }
    }

    async fn destroy_session(&self, id: &str) -> std::result::Result<(), ConsulError> {
        self.call(HttpRequest::put(format!("/v1/session/destroy/{}", id)))
            .await
            .map(|_| ())
    }
}
