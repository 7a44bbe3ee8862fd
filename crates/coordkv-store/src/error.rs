//! Error types for the coordination store.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by every store backend.
///
/// The variants are kinds, not transport details: callers must be able to
/// tell a missing key apart from a dead server without inspecting messages.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key or prefix does not exist.
    #[error("key not found: {key}")]
    NotFound {
        /// Normalized key that was looked up.
        key: String,
    },

    /// A create-only write found the key already present.
    #[error("key already exists: {key}")]
    KeyExists {
        /// Normalized key.
        key: String,
    },

    /// A compare-and-swap precondition failed because the key changed.
    #[error("key modified since last read: {key}")]
    KeyModified {
        /// Normalized key.
        key: String,
    },

    /// `atomic_delete` was called without a previous pair.
    #[error("previous pair must be specified for atomic delete")]
    PreviousNotSpecified,

    /// The backend lacks the requested capability, or the scheme is unknown.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Transport or session failure. May be transient.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The caller aborted the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The backend call exceeded the configured connection timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The handle was closed.
    #[error("store handle closed")]
    Closed,

    /// A required configuration option was not provided.
    #[error("missing required option: {0}")]
    MissingOption(&'static str),

    /// The embedded database file is held by another handle.
    #[error("database already open: {}", .0.display())]
    AlreadyOpen(PathBuf),

    /// Stored data failed validation.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// The key failed normalization.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey {
        /// Key as given by the caller.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A store URI could not be parsed.
    #[error("invalid store uri '{uri}': {reason}")]
    InvalidUri {
        /// URI as given by the caller.
        uri: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A ttl write targeted a key that already exists without a ttl.
    #[error("cannot make persistent key ephemeral: {key}")]
    EphemeralOnPersistent {
        /// Normalized key.
        key: String,
    },

    /// Backend returned an error the contract has no kind for.
    #[error("backend error: {0}")]
    Backend(String),

    /// Local I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Builds a `NotFound` for `key`.
    pub fn not_found(key: impl Into<String>) -> Self {
        StoreError::NotFound { key: key.into() }
    }

    /// True for errors a watch or retry loop may recover from by waiting.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unreachable(_) | StoreError::Timeout(_))
    }

    /// True if the error reports a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// True for errors after which the handle accepts no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StoreError::Closed | StoreError::Cancelled | StoreError::Corrupt(_)
        )
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StoreError::Unreachable("down".into()).is_transient());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!StoreError::not_found("a").is_transient());
        assert!(StoreError::not_found("a").is_not_found());
        assert!(StoreError::Closed.is_terminal());
        assert!(StoreError::Cancelled.is_terminal());
        assert!(!StoreError::KeyModified { key: "a".into() }.is_terminal());
    }

    #[test]
    fn test_display_names_key() {
        let err = StoreError::KeyExists { key: "a/b".into() };
        assert_eq!(err.to_string(), "key already exists: a/b");
        let err = StoreError::AlreadyOpen(PathBuf::from("/tmp/x.db"));
        assert_eq!(err.to_string(), "database already open: /tmp/x.db");
    }
}
