//! Broadcast routing: fan a completed event out to the session and, for
//! locally-originated events, to peer regions.
//!
//! ```text
//!                       ┌──► push(conn B) ──┐
//! BroadcastEvent ──► ───┼──► push(conn C) ──┼──► RouteSummary
//!   (sender A        │  └──► push(conn D) ──┘      delivered / stale
//!    excluded)       │
//!                    └──► replicate (only if !replicated)
//! ```
//!
//! Delivery is best-effort per target: a stale connection is logged and
//! counted, never allowed to stop delivery to the rest.

use std::sync::Arc;

use futures_util::future::join_all;

use crate::error::RelayError;
use crate::protocol::BroadcastEvent;
use crate::pusher::Pusher;
use crate::registry::ConnectionRegistry;
use crate::replication::{CrossRegionReplicator, ReplicationReport};

/// What one `route` call achieved.
#[derive(Debug, Default)]
pub struct RouteSummary {
    /// Connections the payload was handed to
    pub delivered: usize,
    /// Connections whose push failed
    pub stale: Vec<String>,
    pub replication: ReplicationReport,
}

pub struct BroadcastRouter {
    registry: Arc<dyn ConnectionRegistry>,
    pusher: Arc<dyn Pusher>,
    replicator: Option<Arc<CrossRegionReplicator>>,
}

impl BroadcastRouter {
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        pusher: Arc<dyn Pusher>,
        replicator: Option<Arc<CrossRegionReplicator>>,
    ) -> Self {
        Self {
            registry,
            pusher,
            replicator,
        }
    }

    /// Deliver `event` locally and, unless it is a replica, to peer regions.
    ///
    /// Never fails: every problem is contained in the returned summary.
    pub async fn route(&self, event: &BroadcastEvent) -> RouteSummary {
        let replicate = async {
            match &self.replicator {
                Some(replicator) if !event.replicated => replicator.replicate(event).await,
                _ => ReplicationReport::default(),
            }
        };
        let (local, replication) = tokio::join!(self.fan_out(event), replicate);

        let (delivered, stale) = local;
        RouteSummary {
            delivered,
            stale,
            replication,
        }
    }

    async fn fan_out(&self, event: &BroadcastEvent) -> (usize, Vec<String>) {
        let targets = match self.targets(event).await {
            Ok(targets) => targets,
            Err(e) => {
                log::error!("Cannot resolve targets for session {}: {e}", event.session_id);
                return (0, Vec::new());
            }
        };
        if targets.is_empty() {
            return (0, Vec::new());
        }

        let bytes = match event.encode_for_client() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Cannot encode event {}: {e}", event.message_id);
                return (0, Vec::new());
            }
        };

        let results = join_all(targets.iter().map(|target| {
            let bytes = bytes.clone();
            async move { (target, self.pusher.send(target, bytes).await) }
        }))
        .await;

        let mut delivered = 0;
        let mut stale = Vec::new();
        for (target, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Push to {target} failed: {e}");
                    stale.push(target.clone());
                }
            }
        }
        log::debug!(
            "Routed {} in session {} to {delivered}/{} connections",
            event.message_id,
            event.session_id,
            targets.len()
        );
        (delivered, stale)
    }

    /// Live connections of the event's session, minus its sender.
    async fn targets(&self, event: &BroadcastEvent) -> Result<Vec<String>, RelayError> {
        let mut connections = self.registry.list_by_session(&event.session_id).await?;
        connections.retain(|c| *c != event.sender_connection_id);
        Ok(connections)
    }
}
