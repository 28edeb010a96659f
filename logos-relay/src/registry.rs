//! Connection registry: which live connections belong to which session.
//!
//! Entries expire after a bounded TTL even if the transport never reports a
//! disconnect; expired entries are evicted lazily on listing and eagerly by
//! [`ConnectionRegistry::purge_expired`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::RelayError;

/// Default connection lifetime without an explicit leave (1 hour).
pub const DEFAULT_CONNECTION_TTL_SECS: u64 = 3600;

/// One live client attachment to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub connection_id: String,
    pub session_id: String,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Connection {
    fn is_live(&self, now: u64) -> bool {
        now <= self.expires_at
    }
}

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Add (or refresh) a connection; re-joining resets its TTL.
    async fn join(&self, session_id: &str, connection_id: &str) -> Result<(), RelayError>;

    /// Remove a connection. Unknown entries are a no-op.
    async fn leave(&self, session_id: &str, connection_id: &str) -> Result<(), RelayError>;

    /// Live connection ids of a session, sorted.
    async fn list_by_session(&self, session_id: &str) -> Result<Vec<String>, RelayError>;

    /// Drop every expired entry. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, RelayError>;
}

/// Registry kept in process memory.
pub struct InMemoryConnectionRegistry {
    sessions: RwLock<HashMap<String, HashMap<String, Connection>>>,
    ttl_secs: u64,
    clock: Arc<dyn Clock>,
}

impl InMemoryConnectionRegistry {
    pub fn new(ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl_secs,
            clock,
        }
    }

    /// Look up a single connection (expired entries are reported as absent).
    pub async fn connection(&self, session_id: &str, connection_id: &str) -> Option<Connection> {
        let now = self.clock.now_secs();
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .and_then(|conns| conns.get(connection_id))
            .filter(|c| c.is_live(now))
            .cloned()
    }

    /// Number of sessions with at least one tracked entry.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl ConnectionRegistry for InMemoryConnectionRegistry {
    async fn join(&self, session_id: &str, connection_id: &str) -> Result<(), RelayError> {
        let now = self.clock.now_secs();
        let mut sessions = self.sessions.write().await;
        let conns = sessions.entry(session_id.to_string()).or_default();
        let created_at = conns
            .get(connection_id)
            .filter(|c| c.is_live(now))
            .map_or(now, |c| c.created_at);
        conns.insert(
            connection_id.to_string(),
            Connection {
                connection_id: connection_id.to_string(),
                session_id: session_id.to_string(),
                created_at,
                expires_at: now + self.ttl_secs,
            },
        );
        log::debug!("Connection {connection_id} joined session {session_id}");
        Ok(())
    }

    async fn leave(&self, session_id: &str, connection_id: &str) -> Result<(), RelayError> {
        let mut sessions = self.sessions.write().await;
        if let Some(conns) = sessions.get_mut(session_id) {
            if conns.remove(connection_id).is_some() {
                log::debug!("Connection {connection_id} left session {session_id}");
            }
            if conns.is_empty() {
                sessions.remove(session_id);
            }
        }
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<String>, RelayError> {
        let now = self.clock.now_secs();

        // Fast path: nothing expired, read lock only
        {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                None => return Ok(Vec::new()),
                Some(conns) if conns.values().all(|c| c.is_live(now)) => {
                    let mut ids: Vec<String> = conns.keys().cloned().collect();
                    ids.sort();
                    return Ok(ids);
                }
                Some(_) => {}
            }
        }

        // Slow path: evict expired entries under the write lock
        let mut sessions = self.sessions.write().await;
        let Some(conns) = sessions.get_mut(session_id) else {
            return Ok(Vec::new());
        };
        let before = conns.len();
        conns.retain(|_, c| c.is_live(now));
        let evicted = before - conns.len();
        if evicted > 0 {
            log::debug!("Evicted {evicted} expired connections from session {session_id}");
        }
        let mut ids: Vec<String> = conns.keys().cloned().collect();
        ids.sort();
        if conns.is_empty() {
            sessions.remove(session_id);
        }
        Ok(ids)
    }

    async fn purge_expired(&self) -> Result<usize, RelayError> {
        let now = self.clock.now_secs();
        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        for conns in sessions.values_mut() {
            let before = conns.len();
            conns.retain(|_, c| c.is_live(now));
            removed += before - conns.len();
        }
        sessions.retain(|_, conns| !conns.is_empty());
        Ok(removed)
    }
}
