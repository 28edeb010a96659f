//! In-process stores.
//!
//! All fragment state for the process sits behind one `RwLock`, so the
//! completion claim is a read-modify-write under the write lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FragmentStore, SnapshotStore, StoreError, StoredFragment};
use crate::clock::Clock;
use crate::protocol::{LogicalMessage, MessageKey};

type FragmentSet = BTreeMap<u32, StoredFragment>;

#[derive(Default)]
struct FragmentState {
    /// session id → message key → seq → fragment
    sessions: HashMap<String, HashMap<MessageKey, FragmentSet>>,
    /// message key → marker expiry
    completions: HashMap<MessageKey, u64>,
}

impl FragmentState {
    fn set(&self, key: &MessageKey) -> Option<&FragmentSet> {
        self.sessions.get(&key.session_id).and_then(|sets| sets.get(key))
    }
}

/// Fragment store kept in process memory.
pub struct InMemoryFragmentStore {
    state: RwLock<FragmentState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryFragmentStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(FragmentState::default()),
            clock,
        }
    }

    /// Total fragments held, live or not.
    pub async fn fragment_count(&self) -> usize {
        let state = self.state.read().await;
        state
            .sessions
            .values()
            .flat_map(|sets| sets.values())
            .map(|set| set.len())
            .sum()
    }
}

#[async_trait]
impl FragmentStore for InMemoryFragmentStore {
    async fn put(&self, key: &MessageKey, fragment: StoredFragment) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .sessions
            .entry(key.session_id.clone())
            .or_default()
            .entry(key.clone())
            .or_default()
            .insert(fragment.seq, fragment);
        Ok(())
    }

    async fn get(&self, key: &MessageKey, seq: u32) -> Result<Option<StoredFragment>, StoreError> {
        let now = self.clock.now_secs();
        let state = self.state.read().await;
        Ok(state
            .set(key)
            .and_then(|set| set.get(&seq))
            .filter(|f| f.is_live(now))
            .cloned())
    }

    async fn count_data(&self, key: &MessageKey) -> Result<usize, StoreError> {
        let now = self.clock.now_secs();
        let state = self.state.read().await;
        Ok(state.set(key).map_or(0, |set| {
            set.range(1..).filter(|(_, f)| f.is_live(now)).count()
        }))
    }

    async fn query_data(&self, key: &MessageKey) -> Result<Vec<StoredFragment>, StoreError> {
        let now = self.clock.now_secs();
        let state = self.state.read().await;
        Ok(state.set(key).map_or_else(Vec::new, |set| {
            set.range(1..)
                .map(|(_, f)| f)
                .filter(|f| f.is_live(now))
                .cloned()
                .collect()
        }))
    }

    async fn query_by_session(&self, session_id: &str) -> Result<Vec<MessageKey>, StoreError> {
        let state = self.state.read().await;
        let mut keys: Vec<MessageKey> = state
            .sessions
            .get(session_id)
            .map(|sets| sets.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn claim_completion(&self, key: &MessageKey, expires_at: u64) -> Result<bool, StoreError> {
        let now = self.clock.now_secs();
        let mut state = self.state.write().await;
        let already_claimed = state.completions.get(key).is_some_and(|&marker| now <= marker);
        if already_claimed {
            return Ok(false);
        }
        state.completions.insert(key.clone(), expires_at);
        Ok(true)
    }

    async fn delete_set(&self, key: &MessageKey) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let Some(sets) = state.sessions.get_mut(&key.session_id) else {
            return Ok(0);
        };
        let removed = sets.remove(key).map_or(0, |set| set.len());
        if sets.is_empty() {
            state.sessions.remove(&key.session_id);
        }
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_secs();
        let mut state = self.state.write().await;
        let mut removed = 0;
        for sets in state.sessions.values_mut() {
            for set in sets.values_mut() {
                let before = set.len();
                set.retain(|_, f| f.is_live(now));
                removed += before - set.len();
            }
            sets.retain(|_, set| !set.is_empty());
        }
        state.sessions.retain(|_, sets| !sets.is_empty());

        let before = state.completions.len();
        state.completions.retain(|_, marker| now <= *marker);
        removed += before - state.completions.len();
        Ok(removed)
    }
}

/// Snapshot store kept in process memory.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Vec<LogicalMessage>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(&self, session_id: &str) -> Result<Vec<LogicalMessage>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put(&self, session_id: &str, messages: Vec<LogicalMessage>) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().await;
        if messages.is_empty() {
            snapshots.remove(session_id);
        } else {
            snapshots.insert(session_id.to_string(), messages);
        }
        Ok(())
    }
}
