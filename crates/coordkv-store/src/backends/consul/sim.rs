//! In-process Consul agent for tests.
//!
//! Models a single raft index bumped by every write, `cas` and
//! `acquire`/`release` preconditions, sessions with ttl expiry and the
//! `delete`/`release` behaviors, and blocking queries that return once the
//! index moves. Fault injection: [`SimConsul::set_unavailable`] fails every
//! call, [`SimConsul::expire_session`] invalidates a session immediately.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use super::client::{
    BlockingQuery, ConsulClient, ConsulError, ConsulPair, KvWrite, SessionBehavior, SessionSpec,
};

#[derive(Debug, Clone)]
struct SimSession {
    spec: SessionSpec,
    expires: Instant,
}

#[derive(Debug, Default)]
struct SimState {
    kv: BTreeMap<String, ConsulPair>,
    sessions: HashMap<String, SimSession>,
    index: u64,
    unavailable: bool,
}

impl SimState {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Invalidates a session and applies its behavior to held keys.
    fn invalidate(&mut self, id: &str) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };
        let held: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, pair)| pair.session.as_deref() == Some(id))
            .map(|(key, _)| key.clone())
            .collect();
        let index = self.bump();
        for key in held {
            match session.spec.behavior {
                SessionBehavior::Delete => {
                    self.kv.remove(&key);
                }
                SessionBehavior::Release => {
                    if let Some(pair) = self.kv.get_mut(&key) {
                        pair.session = None;
                        pair.modify_index = index;
                    }
                }
            }
        }
        true
    }

    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut any = false;
        for id in expired {
            any |= self.invalidate(&id);
        }
        any
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.sessions.values().map(|s| s.expires).min()
    }
}

/// Shared simulated Consul cluster.
#[derive(Debug)]
pub struct SimConsul {
    state: Mutex<SimState>,
    index_tx: watch::Sender<u64>,
}

impl SimConsul {
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

    /// Invalidates a session as if its ttl had run out.
    pub fn expire_session(&self, id: &str) {
        let mut state = self.lock();
        if state.invalidate(id) {
            self.index_tx.send_replace(state.index);
        }
    }

    /// Ids of live sessions.
    pub fn sessions(&self) -> Vec<String> {
        let mut state = self.lock();
        state.purge_expired(Instant::now());
        state.sessions.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin(&self) -> Result<MutexGuard<'_, SimState>, ConsulError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(ConsulError::Unavailable("simulated outage".into()));
        }
        if state.purge_expired(Instant::now()) {
            self.index_tx.send_replace(state.index);
        }
        Ok(state)
    }

    fn publish(&self, state: &SimState) {
        self.index_tx.send_replace(state.index);
    }

    /// Runs `read` now, or once the index passes `query.index`, or when the
    /// wait runs out.
    async fn blocking<T, F>(
        &self,
        query: Option<BlockingQuery>,
        read: F,
    ) -> Result<(T, u64), ConsulError>
    where
        F: Fn(&SimState) -> T + Send,
        T: Send,
    {
        let Some(query) = query else {
            let state = self.begin()?;
            return Ok((read(&state), state.index.max(1)));
        };
        let deadline = Instant::now() + query.wait;
        loop {
            let mut rx = self.index_tx.subscribe();
            let next_expiry = {
                let state = self.begin()?;
                if state.index > query.index || Instant::now() >= deadline {
                    return Ok((read(&state), state.index.max(1)));
                }
                state.next_expiry()
            };
            let wake = next_expiry.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = rx.changed() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

#[async_trait]
impl ConsulClient for SimConsul {
    async fn get(
        &self,
        key: &str,
        query: Option<BlockingQuery>,
    ) -> Result<(Option<ConsulPair>, u64), ConsulError> {
        let key = key.trim_start_matches('/').to_string();
        self.blocking(query, |state| state.kv.get(&key).cloned()).await
    }

    async fn list(
        &self,
        prefix: &str,
        query: Option<BlockingQuery>,
    ) -> Result<(Vec<ConsulPair>, u64), ConsulError> {
        let prefix = prefix.trim_start_matches('/').to_string();
        self.blocking(query, |state| {
            state
                .kv
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(_, pair)| pair.clone())
                .collect()
        })
        .await
    }

    async fn put(&self, key: &str, write: KvWrite) -> Result<bool, ConsulError> {
        let key = key.trim_start_matches('/').to_string();
        let mut state = self.begin()?;
        let current = state.kv.get(&key).cloned();

        match write.cas {
            Some(0) if current.is_some() => return Ok(false),
            Some(index) if index > 0 => match &current {
                Some(pair) if pair.modify_index == index => {}
                _ => return Ok(false),
            },
            _ => {}
        }

        let mut session = current.as_ref().and_then(|p| p.session.clone());
        let mut lock_index = current.as_ref().map_or(0, |p| p.lock_index);
        if let Some(id) = &write.acquire {
            if !state.sessions.contains_key(id) {
                return Err(ConsulError::InvalidSession(format!(
                    "invalid session \"{}\"",
                    id
                )));
            }
            match &session {
                Some(holder) if holder != id => return Ok(false),
                Some(_) => {}
                None => {
                    lock_index += 1;
                    session = Some(id.clone());
                }
            }
        }
        if let Some(id) = &write.release {
            match &session {
                Some(holder) if holder == id => session = None,
                Some(_) => return Ok(false),
                None => {}
            }
        }

        let index = state.bump();
        let pair = ConsulPair {
            key: key.clone(),
            value: write.value,
            flags: 0,
            create_index: current.as_ref().map_or(index, |p| p.create_index),
            modify_index: index,
            lock_index,
            session,
        };
        state.kv.insert(key, pair);
        self.publish(&state);
        Ok(true)
    }

    async fn delete(&self, key: &str, cas: Option<u64>, recurse: bool) -> Result<bool, ConsulError> {
        let key = key.trim_start_matches('/').to_string();
        let mut state = self.begin()?;
        if let Some(index) = cas {
            match state.kv.get(&key) {
                Some(pair) if pair.modify_index == index => {}
                _ => return Ok(false),
            }
        }
        let doomed: Vec<String> = if recurse {
            state
                .kv
                .range(key.clone()..)
                .take_while(|(k, _)| k.starts_with(&key))
                .map(|(k, _)| k.clone())
                .collect()
        } else {
            vec![key]
        };
        let mut removed = false;
        for k in doomed {
            removed |= state.kv.remove(&k).is_some();
        }
        if removed {
            state.bump();
            self.publish(&state);
        }
        Ok(true)
    }

    async fn create_session(&self, spec: &SessionSpec) -> Result<String, ConsulError> {
        let mut state = self.begin()?;
        let id = Uuid::new_v4().to_string();
        state.sessions.insert(
            id.clone(),
            SimSession {
                spec: spec.clone(),
                expires: Instant::now() + spec.ttl,
            },
        );
        state.bump();
        self.publish(&state);
        Ok(id)
    }

    async fn renew_session(&self, id: &str) -> Result<(), ConsulError> {
        let mut state = self.begin()?;
        match state.sessions.get_mut(id) {
            Some(session) => {
                session.expires = Instant::now() + session.spec.ttl;
                Ok(())
            }
            None => Err(ConsulError::InvalidSession(id.to_string())),
        }
    }

    async fn destroy_session(&self, id: &str) -> Result<(), ConsulError> {
        let mut state = self.begin()?;
        if state.invalidate(id) {
            self.publish(&state);
        }
        Ok(())
    }
}
