//! HTTP transport shared by the etcd and consul clients.
//!
//! One `reqwest::Client` per handle multiplexes every call. Endpoints are
//! tried round-robin: a connect failure moves on to the next endpoint, and
//! the endpoint that last answered is tried first next time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::{Method, StatusCode, Url};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

/// A request relative to whichever endpoint serves it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl HttpRequest {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// PUT request.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Appends a query parameter.
    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Appends a query parameter when `value` is present.
    pub fn query_opt<T: ToString>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.query(key, value),
            None => self,
        }
    }

    /// Sets the raw body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Overrides the per-call timeout (long polls).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Client plus endpoint rotation.
#[derive(Debug)]
pub struct HttpPool {
    client: reqwest::Client,
    bases: Vec<Url>,
    next: AtomicUsize,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl HttpPool {
    /// Builds the pool from `host:port` (or full URL) endpoints.
    pub fn new(endpoints: &[String], config: &StoreConfig) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::Backend("no endpoints configured".into()));
        }

        let scheme = if config.tls.is_some() { "https" } else { "http" };
        let bases = endpoints
            .iter()
            .map(|endpoint| {
                let raw = if endpoint.contains("://") {
                    endpoint.clone()
                } else {
                    format!("{}://{}", scheme, endpoint)
                };
                Url::parse(&raw).map_err(|_| StoreError::InvalidUri {
                    uri: endpoint.clone(),
                    reason: "endpoint is not a valid host:port",
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut builder = reqwest::Client::builder().connect_timeout(config.connection_timeout());
        if let Some(tls) = &config.tls {
            if let Some(ca) = &tls.ca_file {
                let pem = std::fs::read(ca)?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| StoreError::Backend(format!("bad CA file: {}", e)))?;
                builder = builder.add_root_certificate(cert);
            }
            if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
                let mut pem = std::fs::read(cert)?;
                pem.extend_from_slice(&std::fs::read(key)?);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| StoreError::Backend(format!("bad client certificate: {}", e)))?;
                builder = builder.identity(identity);
            }
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::Backend(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            bases,
            next: AtomicUsize::new(0),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: config.connection_timeout(),
        })
    }

    /// Number of configured endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.bases.len()
    }

    /// Sends `request`, rotating through endpoints on connect failure.
    ///
    /// A timeout is returned as `Timeout` without trying other endpoints:
    /// long polls time out by design.
    pub async fn send(&self, request: &HttpRequest) -> Result<reqwest::Response> {
        let count = self.bases.len();
        let start = self.next.load(Ordering::Relaxed);
        let timeout = request.timeout.unwrap_or(self.timeout);
        let mut last_error = String::new();

        for attempt in 0..count {
            let idx = (start + attempt) % count;
            let mut url = self.bases[idx].clone();
            url.set_path(&request.path);
            if !request.query.is_empty() {
                let mut pairs = url.query_pairs_mut();
                for (key, value) in &request.query {
                    pairs.append_pair(key, value);
                }
            }

            let mut builder = self
                .client
                .request(request.method.clone(), url.clone())
                .timeout(timeout);
            if let Some(user) = &self.username {
                builder = builder.basic_auth(user, self.password.as_ref());
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            match builder.send().await {
                Ok(response) => {
                    self.next.store(idx, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) if e.is_timeout() => return Err(StoreError::Timeout(timeout)),
                Err(e) => {
                    debug!(url = %url, error = %e, "endpoint failed, trying next");
                    last_error = e.to_string();
                }
            }
        }

        Err(StoreError::Unreachable(format!(
            "all {} endpoints failed: {}",
            count, last_error
        )))
    }
}

/// Maps a non-success status nobody handled to an error kind. Server errors
/// are transient.
pub fn status_error(status: StatusCode, body: &str) -> StoreError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StoreError::Unreachable(format!("HTTP {}: {}", status, body.trim()))
    } else {
        StoreError::Backend(format!("HTTP {}: {}", status, body.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = HttpRequest::put("/v2/keys/a")
            .query("ttl", 5)
            .query_opt("prevIndex", None::<u64>)
            .query_opt("prevExist", Some(false))
            .timeout(Duration::from_secs(1));
        assert_eq!(req.method, Method::PUT);
        assert_eq!(
            req.query,
            vec![
                ("ttl".to_string(), "5".to_string()),
                ("prevExist".to_string(), "false".to_string())
            ]
        );
        assert_eq!(req.timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_pool_parses_endpoints() {
        let pool = HttpPool::new(
            &["a:4001".to_string(), "https://b:4001".to_string()],
            &StoreConfig::default(),
        )
        .unwrap();
        assert_eq!(pool.endpoint_count(), 2);
        assert_eq!(pool.bases[0].scheme(), "http");
        assert_eq!(pool.bases[1].scheme(), "https");
        assert!(HttpPool::new(&[], &StoreConfig::default()).is_err());
    }

    #[test]
    fn test_status_error_kinds() {
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_endpoints() {
        let config = StoreConfig::default().with_timeout(Duration::from_millis(200));
        let pool = HttpPool::new(&["127.0.0.1:1".to_string()], &config).unwrap();
        let err = pool.send(&HttpRequest::get("/v2/keys/a")).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }
}
