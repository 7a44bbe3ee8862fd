//! Native Consul KV and session primitives the adapter is written against.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Error returned by a Consul client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsulError {
    /// The agent could not be reached or answered with a server error.
    #[error("consul unavailable: {0}")]
    Unavailable(String),
    /// The session named in the request does not exist (expired or
    /// destroyed).
    #[error("consul session invalid: {0}")]
    InvalidSession(String),
    /// The agent rejected the request.
    #[error("consul rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The agent answered with something unusable.
    #[error("consul protocol error: {0}")]
    Protocol(String),
}

/// One KV entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsulPair {
    /// Key without leading slash.
    pub key: String,
    /// Raw value.
    pub value: Vec<u8>,
    /// Opaque client flags.
    pub flags: u64,
    /// Raft index of creation.
    pub create_index: u64,
    /// Raft index of the last modification.
    pub modify_index: u64,
    /// Number of times the key was acquired.
    pub lock_index: u64,
    /// Session currently holding the key.
    pub session: Option<String>,
}

/// Blocking-query parameters: return once the index moves past `index` or
/// `wait` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingQuery {
    /// Last index seen by the caller.
    pub index: u64,
    /// Longest time the agent may hold the request.
    pub wait: Duration,
}

/// Parameters of a KV write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvWrite {
    /// Value to store.
    pub value: Vec<u8>,
    /// `Some(0)` creates only; `Some(n)` requires `modify_index == n`.
    pub cas: Option<u64>,
    /// Acquire the key with this session.
    pub acquire: Option<String>,
    /// Release the key held by this session.
    pub release: Option<String>,
}

/// What happens to keys held by a session when it is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionBehavior {
    /// Held keys lose their session.
    Release,
    /// Held keys are deleted.
    #[default]
    Delete,
}

impl SessionBehavior {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionBehavior::Release => "release",
            SessionBehavior::Delete => "delete",
        }
    }
}

/// Parameters of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    /// Human-readable name.
    pub name: String,
    /// Session ttl; the session is invalidated if not renewed in time.
    pub ttl: Duration,
    /// Fate of held keys on invalidation.
    pub behavior: SessionBehavior,
    /// Delay before a released lock may be re-acquired.
    pub lock_delay: Duration,
}

/// Consul KV and session endpoints.
#[async_trait]
pub trait ConsulClient: Send + Sync {
    /// Reads one key. `None` when absent. The second value is the index the
    /// read was served at.
    async fn get(
        &self,
        key: &str,
        query: Option<BlockingQuery>,
    ) -> Result<(Option<ConsulPair>, u64), ConsulError>;

    /// Reads every key starting with `prefix` (plain string prefix).
    async fn list(
        &self,
        prefix: &str,
        query: Option<BlockingQuery>,
    ) -> Result<(Vec<ConsulPair>, u64), ConsulError>;

    /// Writes a key. `false` when a cas or acquire precondition failed.
    async fn put(&self, key: &str, write: KvWrite) -> Result<bool, ConsulError>;

    /// Deletes a key, or every key under it when `recurse`. `false` when the
    /// cas precondition failed.
    async fn delete(&self, key: &str, cas: Option<u64>, recurse: bool)
        -> Result<bool, ConsulError>;

    /// Creates a session and returns its id.
    async fn create_session(&self, spec: &SessionSpec) -> Result<String, ConsulError>;

    /// Renews a session. `InvalidSession` once it is gone.
    async fn renew_session(&self, id: &str) -> Result<(), ConsulError>;

    /// Destroys a session, applying its behavior to held keys.
    async fn destroy_session(&self, id: &str) -> Result<(), ConsulError>;
}
