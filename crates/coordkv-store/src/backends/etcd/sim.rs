//! In-process etcd v2 server for tests.
//!
//! Models the parts of etcd the adapter relies on: a cluster index bumped
//! by every write, per-node modified indexes, auto-created parent
//! directories, ttl expiry with `expire` events, a bounded event history
//! for `waitIndex` long polls, and the v2 error codes. Fault injection:
//! [`SimEtcd::set_unavailable`] fails every call, [`SimEtcd::compact_history`]
//! forces `EventIndexCleared` on the next stale watch.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use super::client::{
    codes, DeleteRequest, EtcdClient, EtcdError, EtcdEvent, EtcdNode, EtcdResponse, SetRequest,
};
use crate::keys;

/// Events kept for `waitIndex` polls.
pub const HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
struct SimNode {
    value: Vec<u8>,
    dir: bool,
    created: u64,
    modified: u64,
    ttl: Option<Duration>,
    expires: Option<Instant>,
}

#[derive(Debug, Default)]
struct SimState {
    /// Normalized key (no leading slash) to node. The root is implicit.
    nodes: BTreeMap<String, SimNode>,
    index: u64,
    history: VecDeque<EtcdEvent>,
    cleared_through: u64,
    unavailable: bool,
}

/// Shared simulated etcd cluster. Every adapter built on the same
/// `Arc<SimEtcd>` sees the same data.
#[derive(Debug)]
pub struct SimEtcd {
    state: Mutex<SimState>,
    index_tx: watch::Sender<u64>,
}

impl SimEtcd {
    /// Creates an empty cluster.
    pub fn new() -> Arc<Self> {
        let (index_tx, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(SimState::default()),
            index_tx,
        })
    }

    /// Makes every call fail with `Unavailable` while `down` is true.
    pub fn set_unavailable(&self, down: bool) {
        self.lock().unavailable = down;
        self.index_tx.send_modify(|_| {});
    }

    /// Drops the event history, as if the cluster compacted it.
    pub fn compact_history(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.cleared_through = state.index;
    }

    /// Current cluster index.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Locks the state for a call: fails when unavailable, expires due
    /// nodes first.
    fn begin(&self) -> Result<MutexGuard<'_, SimState>, EtcdError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(EtcdError::Unavailable("simulated outage".into()));
        }
        if state.purge_expired(Instant::now()) {
            self.index_tx.send_replace(state.index);
        }
        Ok(state)
    }
}

fn normalize(key: &str) -> Result<String, EtcdError> {
    keys::normalize(key).map_err(|e| EtcdError::Protocol(e.to_string()))
}

fn is_under(key: &str, dir: &str) -> bool {
    dir.is_empty() || (key.len() > dir.len() && keys::has_prefix(key, dir))
}

impl SimState {
    fn not_found(&self, key: &str) -> EtcdError {
        EtcdError::api(codes::KEY_NOT_FOUND, "Key not found", self.index)
            .with_cause(key)
    }

    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn record(&mut self, action: &str, node: EtcdNode) {
        self.history.push_back(EtcdEvent {
            action: action.to_string(),
            node,
        });
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.cleared_through = dropped.node.modified_index;
            }
        }
    }

    fn view(&self, key: &str, node: &SimNode, depth: Option<usize>) -> EtcdNode {
        let nodes = if node.dir && depth != Some(0) {
            self.children(key, depth.map(|d| d - 1))
        } else {
            Vec::new()
        };
        EtcdNode {
            key: keys::rooted(key),
            value: if node.dir { Vec::new() } else { node.value.clone() },
            dir: node.dir,
            nodes,
            modified_index: node.modified,
            created_index: node.created,
            ttl: node
                .expires
                .map(|at| at.saturating_duration_since(Instant::now()))
                .or(node.ttl),
        }
    }

    fn children(&self, dir: &str, depth: Option<usize>) -> Vec<EtcdNode> {
        self.nodes
            .iter()
            .filter(|(key, _)| {
                is_under(key, dir) && !keys::relative(key, dir).unwrap_or("").contains('/')
            })
            .map(|(key, node)| self.view(key, node, depth))
            .collect()
    }

    fn remove_subtree(&mut self, key: &str) {
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| k.as_str() == key || is_under(k, key))
            .cloned()
            .collect();
        for k in doomed {
            self.nodes.remove(&k);
        }
    }

    /// Removes expired nodes, recording an `expire` event for each.
    /// Returns true if anything expired.
    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.expires.map_or(false, |at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        let mut any = false;
        for key in expired {
            let Some(node) = self.nodes.get(&key).cloned() else {
                continue;
            };
            let index = self.bump();
            let mut view = self.view(&key, &node, Some(0));
            view.modified_index = index;
            view.ttl = None;
            self.remove_subtree(&key);
            self.record("expire", view);
            any = true;
        }
        any
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.nodes.values().filter_map(|node| node.expires).min()
    }

    fn ensure_parents(&mut self, key: &str, index: u64) -> Result<(), EtcdError> {
        for ancestor in keys::ancestors(key) {
            match self.nodes.get(ancestor) {
                Some(node) if !node.dir => {
                    return Err(EtcdError::api(codes::NOT_DIR, "Not a directory", self.index)
                        .with_cause(ancestor))
                }
                Some(_) => {}
                None => {
                    self.nodes.insert(
                        ancestor.to_string(),
                        SimNode {
                            value: Vec::new(),
                            dir: true,
                            created: index,
                            modified: index,
                            ttl: None,
                            expires: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

impl EtcdError {
    fn with_cause(self, cause: &str) -> Self {
        match self {
            EtcdError::Api {
                code,
                message,
                index,
            } => EtcdError::Api {
                code,
                message: format!("{} ({})", message, keys::rooted(cause)),
                index,
            },
            other => other,
        }
    }
}

#[async_trait]
impl EtcdClient for SimEtcd {
    async fn get(&self, key: &str, recursive: bool) -> Result<EtcdResponse, EtcdError> {
        let key = normalize(key)?;
        let state = self.begin()?;
        let depth = if recursive { None } else { Some(1) };
        let node = if key.is_empty() {
            EtcdNode {
                key: "/".into(),
                dir: true,
                nodes: state.children("", depth.map(|d| d - 1)),
                ..Default::default()
            }
        } else {
            let node = state.nodes.get(&key).ok_or_else(|| state.not_found(&key))?;
            state.view(&key, node, depth)
        };
        Ok(EtcdResponse {
            node,
            index: state.index,
        })
    }

    async fn set(&self, key: &str, request: SetRequest) -> Result<EtcdNode, EtcdError> {
        let key = normalize(key)?;
        if key.is_empty() {
            return Err(EtcdError::api(107, "Root is read only", 0));
        }
        let mut state = self.begin()?;
        let existing = state.nodes.get(&key).cloned();

        match (request.prev_exist, &existing) {
            (Some(false), Some(_)) => {
                return Err(EtcdError::api(codes::NODE_EXIST, "Key already exists", state.index)
                    .with_cause(&key))
            }
            (Some(true), None) => return Err(state.not_found(&key)),
            _ => {}
        }
        if let Some(prev_index) = request.prev_index {
            match &existing {
                None => return Err(state.not_found(&key)),
                Some(node) if node.modified != prev_index => {
                    return Err(EtcdError::api(
                        codes::TEST_FAILED,
                        format!("Compare failed ([{} != {}])", prev_index, node.modified),
                        state.index,
                    ))
                }
                Some(_) => {}
            }
        }
        if let Some(node) = &existing {
            if node.dir && !request.dir {
                return Err(EtcdError::api(codes::NOT_FILE, "Not a file", state.index)
                    .with_cause(&key));
            }
        }

        let now = Instant::now();
        if request.refresh {
            let Some(mut node) = existing else {
                return Err(state.not_found(&key));
            };
            let index = state.bump();
            node.modified = index;
            node.ttl = request.ttl;
            node.expires = request.ttl.map(|ttl| now + ttl);
            let view = state.view(&key, &node, Some(0));
            state.nodes.insert(key, node);
            return Ok(view);
        }

        let index = state.index + 1;
        state.ensure_parents(&key, index)?;
        state.index = index;

        let node = SimNode {
            value: if request.dir { Vec::new() } else { request.value },
            dir: request.dir,
            created: existing.as_ref().map_or(index, |n| n.created),
            modified: index,
            ttl: request.ttl,
            expires: request.ttl.map(|ttl| now + ttl),
        };
        let action = if request.prev_index.is_some() {
            "compareAndSwap"
        } else if request.prev_exist == Some(false) {
            "create"
        } else if existing.is_some() {
            "update"
        } else {
            "set"
        };
        let view = state.view(&key, &node, Some(0));
        state.nodes.insert(key, node);
        state.record(action, view.clone());
        self.index_tx.send_replace(state.index);
        Ok(view)
    }

    async fn delete(&self, key: &str, request: DeleteRequest) -> Result<EtcdNode, EtcdError> {
        let key = normalize(key)?;
        if key.is_empty() {
            return Err(EtcdError::api(107, "Root is read only", 0));
        }
        let mut state = self.begin()?;
        let node = state
            .nodes
            .get(&key)
            .cloned()
            .ok_or_else(|| state.not_found(&key))?;

        if let Some(prev_index) = request.prev_index {
            if node.modified != prev_index {
                return Err(EtcdError::api(
                    codes::TEST_FAILED,
                    format!("Compare failed ([{} != {}])", prev_index, node.modified),
                    state.index,
                ));
            }
        }
        if node.dir {
            if !request.dir && !request.recursive {
                return Err(EtcdError::api(codes::NOT_FILE, "Not a file", state.index)
                    .with_cause(&key));
            }
            let has_children = state.nodes.keys().any(|k| is_under(k, &key));
            if has_children && !request.recursive {
                return Err(EtcdError::api(
                    codes::DIR_NOT_EMPTY,
                    "Directory not empty",
                    state.index,
                ));
            }
        }

        let index = state.bump();
        let mut view = state.view(&key, &node, Some(0));
        view.modified_index = index;
        view.value = Vec::new();
        view.ttl = None;
        state.remove_subtree(&key);
        let action = if request.prev_index.is_some() {
            "compareAndDelete"
        } else {
            "delete"
        };
        state.record(action, view.clone());
        self.index_tx.send_replace(state.index);
        Ok(view)
    }

    async fn wait(
        &self,
        key: &str,
        recursive: bool,
        wait_index: u64,
        wait: Duration,
    ) -> Result<Option<EtcdEvent>, EtcdError> {
        let key = normalize(key)?;
        let deadline = Instant::now() + wait;
        loop {
            let mut rx = self.index_tx.subscribe();
            let next_expiry = {
                let state = self.begin()?;
                if wait_index <= state.cleared_through {
                    return Err(EtcdError::api(
                        codes::EVENT_INDEX_CLEARED,
                        format!(
                            "The event in requested index is outdated and cleared \
                             (the requested history has been cleared [{}/{}])",
                            state.cleared_through + 1,
                            wait_index
                        ),
                        state.index,
                    ));
                }
                let hit = state.history.iter().find(|event| {
                    if event.node.modified_index < wait_index {
                        return false;
                    }
                    let event_key = event.node.key.trim_start_matches('/');
                    event_key == key
                        || (recursive && is_under(event_key, &key))
                        || (event.is_removal() && is_under(&key, event_key))
                });
                if let Some(event) = hit {
                    return Ok(Some(event.clone()));
                }
                state.next_expiry()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = next_expiry.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = rx.changed() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
