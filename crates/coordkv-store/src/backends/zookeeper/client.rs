//! Native ZooKeeper primitives the adapter is written against.
//!
//! Watches are one-shot: each `*_watch` call returns a receiver that fires
//! at most once. A receiver whose sender is dropped means the connection
//! went away before the watch fired.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::StoreConfig;

/// Error returned by a ZooKeeper client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ZkError {
    /// The node does not exist.
    #[error("node does not exist")]
    NoNode,
    /// The node already exists.
    #[error("node already exists")]
    NodeExists,
    /// Version precondition failed.
    #[error("version conflict")]
    BadVersion,
    /// Delete of a node that has children.
    #[error("node has children")]
    NotEmpty,
    /// Ephemeral nodes cannot have children.
    #[error("ephemeral nodes may not have children")]
    NoChildrenForEphemerals,
    /// The client session expired; the client is unusable.
    #[error("session expired")]
    SessionExpired,
    /// The connection to the ensemble is down.
    #[error("connection loss: {0}")]
    ConnectionLoss(String),
    /// Anything else the server reported.
    #[error("zookeeper error: {0}")]
    Other(String),
}

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the session.
    Persistent,
    /// Deleted when the creating session ends.
    Ephemeral,
    /// Persistent, with a monotonically increasing suffix.
    PersistentSequential,
    /// Ephemeral, with a monotonically increasing suffix.
    EphemeralSequential,
}

impl CreateMode {
    /// True for the session-scoped modes.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// True for the modes that append a sequence number.
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Zxid of creation.
    pub czxid: u64,
    /// Zxid of the last data change.
    pub mzxid: u64,
    /// Number of data changes.
    pub version: i32,
    /// Owning session for ephemeral nodes, zero otherwise.
    pub ephemeral_owner: u64,
    /// Number of children.
    pub num_children: u32,
}

impl Stat {
    /// True if the node is ephemeral.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}

/// What made a watch fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The node was created.
    NodeCreated,
    /// The node was deleted.
    NodeDeleted,
    /// The node's data changed.
    NodeDataChanged,
    /// A child was added or removed.
    NodeChildrenChanged,
    /// The session expired; no further events will come.
    SessionExpired,
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Why it fired.
    pub kind: WatchEventKind,
    /// Node the watch was set on.
    pub path: String,
}

/// One-shot watch receiver.
pub type Watcher = oneshot::Receiver<WatchEvent>;

/// ZooKeeper client bound to one session. Paths are absolute.
#[async_trait]
pub trait ZkClient: Send + Sync {
    /// Session id of this client.
    fn session_id(&self) -> u64;

    /// Creates a node and returns its actual path (with the sequence suffix
    /// for sequential modes) and metadata.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<(String, Stat), ZkError>;

    /// Reads a node's data.
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), ZkError>;

    /// Reads a node's data and leaves a data watch on it.
    async fn get_data_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, Watcher), ZkError>;

    /// Node metadata, `None` if absent.
    async fn exists(&self, path: &str) -> Result<Option<Stat>, ZkError>;

    /// Node metadata plus a watch that fires on creation, deletion or data
    /// change.
    async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, Watcher), ZkError>;

    /// Replaces a node's data, optionally only at `version`.
    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>)
        -> Result<Stat, ZkError>;

    /// Deletes a childless node, optionally only at `version`.
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), ZkError>;

    /// Names of a node's children.
    async fn get_children(&self, path: &str) -> Result<Vec<String>, ZkError>;

    /// Names of a node's children plus a watch on the child list.
    async fn get_children_watch(&self, path: &str) -> Result<(Vec<String>, Watcher), ZkError>;

    /// Ends the session; its ephemeral nodes are removed.
    async fn close(&self);
}

/// Opens ZooKeeper sessions. Supplied by the application, since this crate
/// does not carry the ZooKeeper wire protocol.
pub trait ZkConnector: Send + Sync {
    /// Connects to the ensemble at `endpoints` with the given session
    /// timeout.
    fn connect(
        &self,
        endpoints: &[String],
        session_timeout: Duration,
        config: &StoreConfig,
    ) -> Result<Arc<dyn ZkClient>, ZkError>;
}
