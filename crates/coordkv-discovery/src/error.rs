//! Error types for discovery.

use coordkv_store::StoreError;
use thiserror::Error;

/// Errors surfaced by discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The discovery URI could not be parsed.
    #[error("invalid discovery uri '{uri}': {reason}")]
    InvalidUri {
        /// URI as given.
        uri: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An entry is not a `host:port` pair.
    #[error("invalid endpoint '{entry}': {reason}")]
    InvalidEndpoint {
        /// Entry as given.
        entry: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// `register` was called twice on one discovery handle.
    #[error("already registered as {0}")]
    AlreadyRegistered(String),

    /// The discovery backend cannot do what was asked.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The discovery handle was closed.
    #[error("discovery closed")]
    Closed,

    /// Failure in the underlying store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure talking to the hosted discovery service.
    #[error("discovery service: {0}")]
    Http(#[from] reqwest::Error),
}

impl DiscoveryError {
    /// True when the backend lacks a capability, whether reported by the
    /// discovery layer or by the store underneath.
    pub fn is_not_supported(&self) -> bool {
        matches!(
            self,
            DiscoveryError::NotSupported(_) | DiscoveryError::Store(StoreError::NotSupported(_))
        )
    }

    pub(crate) fn invalid_uri(uri: &str, reason: impl Into<String>) -> Self {
        DiscoveryError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;
