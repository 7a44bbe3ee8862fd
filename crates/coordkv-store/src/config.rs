//! Store handle configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::types::Backend;

/// Option key: consul session ttl in seconds.
pub const OPT_SESSION_TTL: &str = "session_ttl";
/// Option key: long-poll wait in seconds for watch calls.
pub const OPT_WATCH_WAIT: &str = "watch_wait";
/// Option key: smallest ttl in seconds the backend accepts.
pub const OPT_MIN_TTL: &str = "min_ttl";

/// TLS material for HTTP backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM CA bundle used to verify the server.
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate.
    pub cert_file: Option<PathBuf>,
    /// PEM client private key.
    pub key_file: Option<PathBuf>,
}

/// Configuration passed to every backend constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bounds the first connect and every backend call.
    pub connection_timeout_ms: u64,
    /// Optional TLS material.
    pub tls: Option<TlsConfig>,
    /// Bucket name, required by the embedded backend.
    pub bucket: Option<String>,
    /// Keep the embedded database open for the life of the handle.
    pub persist_connection: bool,
    /// Basic-auth user for HTTP backends.
    pub username: Option<String>,
    /// Basic-auth password for HTTP backends.
    pub password: Option<String>,
    /// Backend-specific options.
    pub options: BTreeMap<String, String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 10_000,
            tls: None,
            bucket: None,
            persist_connection: false,
            username: None,
            password: None,
            options: BTreeMap::new(),
        }
    }
}

impl StoreConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Connection timeout as a duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Sets the connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the bucket name.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Sets a backend-specific option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Bucket name or `MissingOption`.
    pub fn require_bucket(&self) -> Result<&str> {
        self.bucket
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or(StoreError::MissingOption("bucket"))
    }

    /// Reads a duration option expressed in (possibly fractional) seconds.
    pub fn duration_option(&self, key: &str) -> Result<Option<Duration>> {
        match self.options.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(|secs| Some(Duration::from_secs_f64(secs)))
                .ok_or_else(|| {
                    StoreError::Backend(format!("option {} is not a duration: {}", key, raw))
                }),
        }
    }
}

/// Raises `ttl` to `min`, logging when it had to.
pub fn raise_ttl(ttl: Duration, min: Duration, backend: Backend) -> Duration {
    if ttl < min {
        warn!(
            backend = %backend,
            requested_ms = ttl.as_millis() as u64,
            minimum_ms = min.as_millis() as u64,
            "ttl below backend minimum, raising"
        );
        min
    } else {
        ttl
    }
}
