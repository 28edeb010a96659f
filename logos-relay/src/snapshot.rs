//! Session snapshots for late joiners.
//!
//! A session's snapshot is the most recently completed logical message in
//! that session (latest wins, no merging). A clear resets it to empty.

use std::sync::Arc;

use crate::error::RelayError;
use crate::protocol::LogicalMessage;
use crate::pusher::Pusher;
use crate::storage::SnapshotStore;

pub struct SnapshotService {
    store: Arc<dyn SnapshotStore>,
    pusher: Arc<dyn Pusher>,
}

impl SnapshotService {
    pub fn new(store: Arc<dyn SnapshotStore>, pusher: Arc<dyn Pusher>) -> Self {
        Self { store, pusher }
    }

    /// Stored messages for a session; empty if none.
    pub async fn get_state(&self, session_id: &str) -> Result<Vec<LogicalMessage>, RelayError> {
        Ok(self.store.get(session_id).await?)
    }

    /// Push the session's snapshot to one requesting connection, in stored
    /// order. Returns how many packets were pushed.
    pub async fn handle_state_request(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<usize, RelayError> {
        let messages = self.get_state(session_id).await?;
        for message in &messages {
            let bytes = message.to_delivered_packet().encode()?;
            self.pusher.send(connection_id, Arc::new(bytes)).await?;
        }
        log::debug!(
            "Sent {} snapshot packets of session {session_id} to {connection_id}",
            messages.len()
        );
        Ok(messages.len())
    }

    /// Make `message` the session's snapshot.
    pub async fn record(&self, message: &LogicalMessage) -> Result<(), RelayError> {
        self.store
            .put(&message.key.session_id, vec![message.clone()])
            .await?;
        Ok(())
    }

    /// Forget the session's snapshot.
    pub async fn reset(&self, session_id: &str) -> Result<(), RelayError> {
        self.store.put(session_id, Vec::new()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeliveredPacket, MessageKey};
    use crate::pusher::ChannelPusher;
    use crate::storage::InMemorySnapshotStore;

    fn message(sender: &str, id: &str, payload: &str) -> LogicalMessage {
        LogicalMessage {
            key: MessageKey::new("S", sender, id),
            fragment_count: 1,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn service() -> (SnapshotService, Arc<ChannelPusher>) {
        let pusher = Arc::new(ChannelPusher::new(16));
        let service = SnapshotService::new(Arc::new(InMemorySnapshotStore::new()), pusher.clone());
        (service, pusher)
    }

    #[tokio::test]
    async fn test_empty_session_sends_nothing() {
        let (service, pusher) = service();
        let mut rx = pusher.register("D").await;
        assert_eq!(service.handle_state_request("D", "S").await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_latest_message_wins() {
        let (service, pusher) = service();
        service.record(&message("A", "m1", "first")).await.unwrap();
        service.record(&message("B", "m2", "second")).await.unwrap();

        let mut rx = pusher.register("D").await;
        assert_eq!(service.handle_state_request("D", "S").await.unwrap(), 1);
        let packet = DeliveredPacket::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(packet.sender, "B");
        assert_eq!(packet.packet_id, "m2");
        assert_eq!(packet.contents, "second");
    }

    #[tokio::test]
    async fn test_reset_empties_snapshot() {
        let (service, _pusher) = service();
        service.record(&message("A", "m1", "ABCD")).await.unwrap();
        service.reset("S").await.unwrap();
        assert!(service.get_state("S").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_requester_is_stale() {
        let (service, _pusher) = service();
        service.record(&message("A", "m1", "ABCD")).await.unwrap();
        let err = service.handle_state_request("gone", "S").await.unwrap_err();
        assert!(matches!(err, RelayError::StaleConnection(_)));
    }
}
