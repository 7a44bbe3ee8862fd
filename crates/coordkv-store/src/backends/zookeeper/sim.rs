//! In-process ZooKeeper ensemble for tests.
//!
//! Models a global zxid, per-node versions, mandatory parents, ephemeral
//! and sequential nodes, and one-shot data and child watches. Every
//! [`SimZk::connect`] opens a new session. Fault injection:
//! [`SimZk::expire_session`] expires a session the way the ensemble would,
//! [`SimZk::set_unavailable`] drops every pending watch and fails calls with
//! `ConnectionLoss` until cleared.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::client::{
    CreateMode, Stat, WatchEvent, WatchEventKind, Watcher, ZkClient, ZkConnector, ZkError,
};
use crate::config::StoreConfig;

#[derive(Debug, Clone)]
struct SimNode {
    data: Vec<u8>,
    czxid: u64,
    mzxid: u64,
    version: i32,
    owner: u64,
    next_sequence: u32,
}

type WatchList = Vec<(u64, oneshot::Sender<WatchEvent>)>;

#[derive(Debug)]
struct ZkState {
    nodes: BTreeMap<String, SimNode>,
    zxid: u64,
    next_session: u64,
    live: HashSet<u64>,
    data_watches: HashMap<String, WatchList>,
    child_watches: HashMap<String, WatchList>,
    unavailable: bool,
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn fire(watches: &mut HashMap<String, WatchList>, path: &str, kind: WatchEventKind) {
    if let Some(list) = watches.remove(path) {
        for (_, tx) in list {
            let _ = tx.send(WatchEvent {
                kind,
                path: path.to_string(),
            });
        }
    }
}

impl ZkState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            SimNode {
                data: Vec::new(),
                czxid: 0,
                mzxid: 0,
                version: 0,
                owner: 0,
                next_sequence: 0,
            },
        );
        Self {
            nodes,
            zxid: 0,
            next_session: 0,
            live: HashSet::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            unavailable: false,
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|node| Stat {
            czxid: node.czxid,
            mzxid: node.mzxid,
            version: node.version,
            ephemeral_owner: node.owner,
            num_children: self.children(path).len() as u32,
        })
    }

    fn watch(map: &mut HashMap<String, WatchList>, path: &str, session: u64) -> Watcher {
        let (tx, rx) = oneshot::channel();
        let list = map.entry(path.to_string()).or_default();
        list.retain(|(_, tx)| !tx.is_closed());
        list.push((session, tx));
        rx
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        self.zxid += 1;
        fire(&mut self.data_watches, path, WatchEventKind::NodeDeleted);
        fire(&mut self.child_watches, path, WatchEventKind::NodeDeleted);
        if let Some(parent) = parent_of(path) {
            let parent = parent.to_string();
            fire(&mut self.child_watches, &parent, WatchEventKind::NodeChildrenChanged);
        }
    }

    /// Ends a session: its ephemerals go, its watches receive
    /// `SessionExpired`.
    fn end_session(&mut self, session: u64, notify: bool) {
        if !self.live.remove(&session) {
            return;
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove_node(&path);
        }
        for map in [&mut self.data_watches, &mut self.child_watches] {
            for (path, list) in map.iter_mut() {
                let (mine, rest): (WatchList, WatchList) =
                    list.drain(..).partition(|(s, _)| *s == session);
                *list = rest;
                for (_, tx) in mine {
                    if notify {
                        let _ = tx.send(WatchEvent {
                            kind: WatchEventKind::SessionExpired,
                            path: path.clone(),
                        });
                    }
                }
            }
        }
    }
}

/// Shared simulated ensemble.
#[derive(Debug)]
pub struct SimZk {
    state: Mutex<ZkState>,
}

impl SimZk {
    /// Creates an ensemble holding only the root node.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ZkState::new()),
        })
    }

    /// Opens a new session.
    pub fn connect(self: &Arc<Self>) -> Arc<SimZkClient> {
        let mut state = self.lock();
        state.next_session += 1;
        let session = state.next_session;
        state.live.insert(session);
        Arc::new(SimZkClient {
            server: self.clone(),
            session,
        })
    }

    /// Connector handing out sessions on this ensemble, for registration.
    pub fn connector(self: &Arc<Self>) -> Arc<dyn ZkConnector> {
        Arc::new(SimConnector {
            server: self.clone(),
        })
    }

    /// Expires `session`, removing its ephemeral nodes.
    pub fn expire_session(&self, session: u64) {
        self.lock().end_session(session, true);
    }

    /// Drops every pending watch and fails calls while `down` is true.
    pub fn set_unavailable(&self, down: bool) {
        let mut state = self.lock();
        state.unavailable = down;
        if down {
            state.data_watches.clear();
            state.child_watches.clear();
        }
    }

    /// Data of a node, bypassing sessions.
    pub fn peek(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).map(|node| node.data.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ZkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct SimConnector {
    server: Arc<SimZk>,
}

impl ZkConnector for SimConnector {
    fn connect(
        &self,
        _endpoints: &[String],
        _session_timeout: Duration,
        _config: &StoreConfig,
    ) -> Result<Arc<dyn ZkClient>, ZkError> {
        Ok(self.server.connect() as Arc<dyn ZkClient>)
    }
}

/// One session on a [`SimZk`].
#[derive(Debug)]
pub struct SimZkClient {
    server: Arc<SimZk>,
    session: u64,
}

impl SimZkClient {
    fn begin(&self) -> Result<MutexGuard<'_, ZkState>, ZkError> {
        let state = self.server.lock();
        if !state.live.contains(&self.session) {
            return Err(ZkError::SessionExpired);
        }
        if state.unavailable {
            return Err(ZkError::ConnectionLoss("simulated outage".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl ZkClient for SimZkClient {
    fn session_id(&self) -> u64 {
        self.session
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<(String, Stat), ZkError> {
        let mut state = self.begin()?;
        let parent = parent_of(path)
            .ok_or(ZkError::NodeExists)?
            .to_string();
        let parent_owner = match state.nodes.get(&parent) {
            Some(node) => node.owner,
            None => return Err(ZkError::NoNode),
        };
        if parent_owner != 0 {
            return Err(ZkError::NoChildrenForEphemerals);
        }

        let actual = if mode.is_sequential() {
            let seq = match state.nodes.get_mut(&parent) {
                Some(node) => {
                    let seq = node.next_sequence;
                    node.next_sequence += 1;
                    seq
                }
                None => return Err(ZkError::NoNode),
            };
            format!("{}{:010}", path, seq)
        } else {
            path.to_string()
        };
        if state.nodes.contains_key(&actual) {
            return Err(ZkError::NodeExists);
        }

        state.zxid += 1;
        let zxid = state.zxid;
        state.nodes.insert(
            actual.clone(),
            SimNode {
                data: data.to_vec(),
                czxid: zxid,
                mzxid: zxid,
                version: 0,
                owner: if mode.is_ephemeral() { self.session } else { 0 },
                next_sequence: 0,
            },
        );
        fire(&mut state.data_watches, &actual, WatchEventKind::NodeCreated);
        fire(&mut state.child_watches, &parent, WatchEventKind::NodeChildrenChanged);
        let stat = state.stat(&actual).unwrap_or_default();
        Ok((actual, stat))
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), ZkError> {
        let state = self.begin()?;
        let node = state.nodes.get(path).ok_or(ZkError::NoNode)?;
        let data = node.data.clone();
        Ok((data, state.stat(path).unwrap_or_default()))
    }

    async fn get_data_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, Watcher), ZkError> {
        let mut state = self.begin()?;
        let data = state.nodes.get(path).ok_or(ZkError::NoNode)?.data.clone();
        let stat = state.stat(path).unwrap_or_default();
        let watcher = ZkState::watch(&mut state.data_watches, path, self.session);
        Ok((data, stat, watcher))
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, ZkError> {
        Ok(self.begin()?.stat(path))
    }

    async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, Watcher), ZkError> {
        let mut state = self.begin()?;
        let stat = state.stat(path);
        let watcher = ZkState::watch(&mut state.data_watches, path, self.session);
        Ok((stat, watcher))
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        version: Option<i32>,
    ) -> Result<Stat, ZkError> {
        let mut state = self.begin()?;
        state.zxid += 1;
        let zxid = state.zxid;
        let node = state.nodes.get_mut(path).ok_or(ZkError::NoNode)?;
        if version.map_or(false, |v| v != node.version) {
            return Err(ZkError::BadVersion);
        }
        node.data = data.to_vec();
        node.version += 1;
        node.mzxid = zxid;
        fire(&mut state.data_watches, path, WatchEventKind::NodeDataChanged);
        Ok(state.stat(path).unwrap_or_default())
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), ZkError> {
        let mut state = self.begin()?;
        if path == "/" {
            return Err(ZkError::Other("cannot delete the root".into()));
        }
        let node = state.nodes.get(path).ok_or(ZkError::NoNode)?;
        if version.map_or(false, |v| v != node.version) {
            return Err(ZkError::BadVersion);
        }
        if !state.children(path).is_empty() {
            return Err(ZkError::NotEmpty);
        }
        state.remove_node(path);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, ZkError> {
        let state = self.begin()?;
        if !state.nodes.contains_key(path) {
            return Err(ZkError::NoNode);
        }
        Ok(state.children(path))
    }

    async fn get_children_watch(&self, path: &str) -> Result<(Vec<String>, Watcher), ZkError> {
        let mut state = self.begin()?;
        if !state.nodes.contains_key(path) {
            return Err(ZkError::NoNode);
        }
        let children = state.children(path);
        let watcher = ZkState::watch(&mut state.child_watches, path, self.session);
        Ok((children, watcher))
    }

    async fn close(&self) {
        self.server.lock().end_session(self.session, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parents_are_mandatory() {
        let zk = SimZk::new();
        let client = zk.connect();
        assert_eq!(
            client.create("/a/b", b"", CreateMode::Persistent).await,
            Err(ZkError::NoNode)
        );
        client.create("/a", b"", CreateMode::Persistent).await.unwrap();
        client.create("/a/b", b"v", CreateMode::Persistent).await.unwrap();
        assert_eq!(client.get_children("/a").await.unwrap(), vec!["b"]);
        assert_eq!(client.delete("/a", None).await, Err(ZkError::NotEmpty));
    }

    #[tokio::test]
    async fn test_versions_and_zxids() {
        let zk = SimZk::new();
        let client = zk.connect();
        let (_, created) = client.create("/k", b"1", CreateMode::Persistent).await.unwrap();
        let updated = client.set_data("/k", b"2", Some(0)).await.unwrap();
        assert_eq!(updated.version, 1);
        assert!(updated.mzxid > created.mzxid);
        assert_eq!(
            client.set_data("/k", b"3", Some(0)).await,
            Err(ZkError::BadVersion)
        );
    }

    #[tokio::test]
    async fn test_sequential_names() {
        let zk = SimZk::new();
        let client = zk.connect();
        client.create("/l", b"", CreateMode::Persistent).await.unwrap();
        let (a, _) = client
            .create("/l/lock-", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let (b, _) = client
            .create("/l/lock-", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(a, "/l/lock-0000000000");
        assert_eq!(b, "/l/lock-0000000001");
    }

    #[tokio::test]
    async fn test_watches_fire_once() {
        let zk = SimZk::new();
        let client = zk.connect();
        client.create("/k", b"1", CreateMode::Persistent).await.unwrap();
        let (_, _, watcher) = client.get_data_watch("/k").await.unwrap();
        client.set_data("/k", b"2", None).await.unwrap();
        assert_eq!(watcher.await.unwrap().kind, WatchEventKind::NodeDataChanged);

        let (_, watcher) = client.get_children_watch("/").await.unwrap();
        client.create("/other", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(
            watcher.await.unwrap().kind,
            WatchEventKind::NodeChildrenChanged
        );
    }

    #[tokio::test]
    async fn test_session_expiry_removes_ephemerals() {
        let zk = SimZk::new();
        let owner = zk.connect();
        let observer = zk.connect();
        owner.create("/eph", b"v", CreateMode::Ephemeral).await.unwrap();
        let (_, watcher) = observer.exists_watch("/eph").await.unwrap();
        let (_, _, own_watch) = owner.get_data_watch("/eph").await.unwrap();

        zk.expire_session(owner.session_id());
        assert_eq!(watcher.await.unwrap().kind, WatchEventKind::NodeDeleted);
        // The owner's own watch on the node fired with the deletion first.
        assert_eq!(own_watch.await.unwrap().kind, WatchEventKind::NodeDeleted);
        assert_eq!(owner.exists("/eph").await, Err(ZkError::SessionExpired));
        assert_eq!(observer.exists("/eph").await, Ok(None));
    }

    #[tokio::test]
    async fn test_outage_drops_watches() {
        let zk = SimZk::new();
        let client = zk.connect();
        client.create("/k", b"1", CreateMode::Persistent).await.unwrap();
        let (_, _, watcher) = client.get_data_watch("/k").await.unwrap();
        zk.set_unavailable(true);
        assert!(watcher.await.is_err());
        assert!(matches!(
            client.get_data("/k").await,
            Err(ZkError::ConnectionLoss(_))
        ));
        zk.set_unavailable(false);
        assert_eq!(client.get_data("/k").await.unwrap().0, b"1");
    }
}
