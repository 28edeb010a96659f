//! Push delivery to individual connections.
//!
//! Each live connection owns a bounded outbound queue drained by its socket
//! task. A push to an unknown, closed, or saturated queue is reported as a
//! stale connection; the caller decides whether that matters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::error::RelayError;

#[async_trait]
pub trait Pusher: Send + Sync {
    /// Deliver `bytes` to one connection.
    async fn send(&self, connection_id: &str, bytes: Arc<Vec<u8>>) -> Result<(), RelayError>;
}

/// Pusher backed by per-connection mpsc queues.
pub struct ChannelPusher {
    outboxes: RwLock<HashMap<String, mpsc::Sender<Arc<Vec<u8>>>>>,
    capacity: usize,
}

impl ChannelPusher {
    /// `capacity` bounds how many frames may queue per connection.
    pub fn new(capacity: usize) -> Self {
        Self {
            outboxes: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open an outbox for a connection; the receiver feeds its socket.
    pub async fn register(&self, connection_id: &str) -> mpsc::Receiver<Arc<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.outboxes
            .write()
            .await
            .insert(connection_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, connection_id: &str) {
        self.outboxes.write().await.remove(connection_id);
    }

    pub async fn outbox_count(&self) -> usize {
        self.outboxes.read().await.len()
    }
}

#[async_trait]
impl Pusher for ChannelPusher {
    async fn send(&self, connection_id: &str, bytes: Arc<Vec<u8>>) -> Result<(), RelayError> {
        let outboxes = self.outboxes.read().await;
        let Some(tx) = outboxes.get(connection_id) else {
            return Err(RelayError::StaleConnection(connection_id.to_string()));
        };
        tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                log::warn!("Outbox for {connection_id} is full, dropping frame");
                RelayError::StaleConnection(format!("{connection_id} (outbox full)"))
            }
            mpsc::error::TrySendError::Closed(_) => {
                RelayError::StaleConnection(connection_id.to_string())
            }
        })
    }
}
