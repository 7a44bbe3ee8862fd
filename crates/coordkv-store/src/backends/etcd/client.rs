//! Native etcd v2 primitives the adapter is written against.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// etcd v2 error codes the adapter reacts to.
pub mod codes {
    /// Key does not exist.
    pub const KEY_NOT_FOUND: u64 = 100;
    /// Compare failed.
    pub const TEST_FAILED: u64 = 101;
    /// Operation on a directory that needs a file.
    pub const NOT_FILE: u64 = 102;
    /// A path component is a file.
    pub const NOT_DIR: u64 = 104;
    /// Create-only write found the key.
    pub const NODE_EXIST: u64 = 105;
    /// Non-recursive delete of a non-empty directory.
    pub const DIR_NOT_EMPTY: u64 = 108;
    /// Requested watch index is older than the retained history.
    pub const EVENT_INDEX_CLEARED: u64 = 401;
}

/// Error returned by an etcd client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EtcdError {
    /// The server answered with an etcd error body.
    #[error("etcd error {code}: {message} (index {index})")]
    Api {
        /// etcd error code, see [`codes`].
        code: u64,
        /// Server message.
        message: String,
        /// Cluster index at the time of the error.
        index: u64,
    },
    /// The server could not be reached or answered with a server error.
    #[error("etcd unavailable: {0}")]
    Unavailable(String),
    /// The server was reached but the reply was unusable.
    #[error("etcd protocol error: {0}")]
    Protocol(String),
}

impl EtcdError {
    /// Builds an API error.
    pub fn api(code: u64, message: impl Into<String>, index: u64) -> Self {
        EtcdError::Api {
            code,
            message: message.into(),
            index,
        }
    }

    /// Error code, if this is an API error.
    pub fn code(&self) -> Option<u64> {
        match self {
            EtcdError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// One node of the etcd key tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdNode {
    /// Rooted key.
    pub key: String,
    /// Value bytes. Empty for directories.
    pub value: Vec<u8>,
    /// Directory flag.
    pub dir: bool,
    /// Children, present for directory reads.
    pub nodes: Vec<EtcdNode>,
    /// Index of the last modification.
    pub modified_index: u64,
    /// Index of creation.
    pub created_index: u64,
    /// Remaining ttl, if the node expires.
    pub ttl: Option<Duration>,
}

impl EtcdNode {
    /// Leaves below (and including) this node, depth first.
    pub fn leaves(&self) -> Vec<&EtcdNode> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a EtcdNode>) {
        if self.dir {
            for child in &self.nodes {
                child.collect_leaves(out);
            }
        } else {
            out.push(self);
        }
    }
}

/// A read and the cluster index it was served at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdResponse {
    /// Node read.
    pub node: EtcdNode,
    /// Cluster index (`X-Etcd-Index`).
    pub index: u64,
}

/// A change reported by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdEvent {
    /// etcd action name (`set`, `create`, `delete`, `expire`, ...).
    pub action: String,
    /// Node after the change.
    pub node: EtcdNode,
}

impl EtcdEvent {
    /// True if the event removed the node.
    pub fn is_removal(&self) -> bool {
        matches!(
            self.action.as_str(),
            "delete" | "expire" | "compareAndDelete"
        )
    }
}

/// Parameters of a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetRequest {
    /// Value to store. Ignored for directories and refreshes.
    pub value: Vec<u8>,
    /// Time to live.
    pub ttl: Option<Duration>,
    /// Create a directory.
    pub dir: bool,
    /// `Some(false)` creates only; `Some(true)` updates only.
    pub prev_exist: Option<bool>,
    /// Compare-and-swap on the modified index.
    pub prev_index: Option<u64>,
    /// Extend the ttl without changing the value or notifying watchers.
    pub refresh: bool,
}

/// Parameters of a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRequest {
    /// Delete the subtree.
    pub recursive: bool,
    /// The target is a directory.
    pub dir: bool,
    /// Compare-and-delete on the modified index.
    pub prev_index: Option<u64>,
}

/// etcd v2 keys API.
#[async_trait]
pub trait EtcdClient: Send + Sync {
    /// Reads a key. Directories include children, all levels when
    /// `recursive`.
    async fn get(&self, key: &str, recursive: bool) -> Result<EtcdResponse, EtcdError>;

    /// Writes a key.
    async fn set(&self, key: &str, request: SetRequest) -> Result<EtcdNode, EtcdError>;

    /// Deletes a key.
    async fn delete(&self, key: &str, request: DeleteRequest) -> Result<EtcdNode, EtcdError>;

    /// Long-polls for the first change to `key` (or its subtree when
    /// `recursive`) at or after `wait_index`. `Ok(None)` means `wait`
    /// elapsed without a change.
    async fn wait(
        &self,
        key: &str,
        recursive: bool,
        wait_index: u64,
        wait: Duration,
    ) -> Result<Option<EtcdEvent>, EtcdError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &str) -> EtcdNode {
        EtcdNode {
            key: key.into(),
            value: b"v".to_vec(),
            modified_index: 1,
            created_index: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_leaves_flatten_directories() {
        let tree = EtcdNode {
            key: "/a".into(),
            dir: true,
            nodes: vec![
                leaf("/a/x"),
                EtcdNode {
                    key: "/a/b".into(),
                    dir: true,
                    nodes: vec![leaf("/a/b/y")],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let keys: Vec<_> = tree.leaves().iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["/a/x", "/a/b/y"]);
    }

    #[test]
    fn test_removal_actions() {
        for action in ["delete", "expire", "compareAndDelete"] {
            let event = EtcdEvent {
                action: action.into(),
                node: leaf("/a"),
            };
            assert!(event.is_removal());
        }
        let event = EtcdEvent {
            action: "set".into(),
            node: leaf("/a"),
        };
        assert!(!event.is_removal());
    }

    #[test]
    fn test_error_code() {
        assert_eq!(
            EtcdError::api(codes::NODE_EXIST, "exists", 3).code(),
            Some(codes::NODE_EXIST)
        );
        assert_eq!(EtcdError::Unavailable("down".into()).code(), None);
    }
}
