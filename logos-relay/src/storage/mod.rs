//! Durable state behind the relay: in-flight fragment sets and session snapshots.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  put / get / count   ┌──────────────────────────────┐
//! │ ReassemblyEngine │ ───────────────────► │ FragmentStore                │
//! │                  │  claim_completion    │  fragments   (session, sender,│
//! └────────┬─────────┘  (compare-and-set)   │               message, seq)   │
//!          │                                │  completions (claim markers)  │
//!          ▼                                └──────────────────────────────┘
//! ┌──────────────────┐     get / put        ┌──────────────────────────────┐
//! │ SnapshotService  │ ───────────────────► │ SnapshotStore (session → msgs)│
//! └──────────────────┘                      └──────────────────────────────┘
//! ```
//!
//! Every query is scoped by message key or session id; nothing on the
//! fragment path scans the whole store. The completion claim is the only
//! operation that needs atomicity beyond a single-key write.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::{LogicalMessage, MessageKey};

pub use memory::{InMemoryFragmentStore, InMemorySnapshotStore};
pub use rocks::{RocksStore, StoreConfig};

/// A fragment as held by a [`FragmentStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFragment {
    pub seq: u32,
    pub expected_count: Option<u32>,
    pub payload: Vec<u8>,
    /// Unix seconds after which the record is garbage
    pub expires_at: u64,
}

impl StoredFragment {
    pub fn is_live(&self, now: u64) -> bool {
        now <= self.expires_at
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Keyed storage for in-flight fragment sets.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    /// Insert or overwrite the fragment at `(key, fragment.seq)`.
    async fn put(&self, key: &MessageKey, fragment: StoredFragment) -> Result<(), StoreError>;

    /// Fetch a single live fragment.
    async fn get(&self, key: &MessageKey, seq: u32) -> Result<Option<StoredFragment>, StoreError>;

    /// Number of live data fragments (seq >= 1) stored for `key`.
    async fn count_data(&self, key: &MessageKey) -> Result<usize, StoreError>;

    /// Live data fragments for `key`, ordered by sequence number.
    async fn query_data(&self, key: &MessageKey) -> Result<Vec<StoredFragment>, StoreError>;

    /// Keys of every fragment set currently held for a session.
    async fn query_by_session(&self, session_id: &str) -> Result<Vec<MessageKey>, StoreError>;

    /// Atomically mark `key` complete. Only the first caller gets `true`.
    ///
    /// The marker outlives [`FragmentStore::delete_set`] until `expires_at`,
    /// so a re-delivered message cannot complete twice.
    async fn claim_completion(&self, key: &MessageKey, expires_at: u64) -> Result<bool, StoreError>;

    /// Remove every fragment of `key`. Returns how many were removed.
    async fn delete_set(&self, key: &MessageKey) -> Result<usize, StoreError>;

    /// Drop expired fragments and completion markers.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// Latest complete state per session.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Vec<LogicalMessage>, StoreError>;

    async fn put(&self, session_id: &str, messages: Vec<LogicalMessage>) -> Result<(), StoreError>;
}
