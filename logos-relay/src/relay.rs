//! Per-region relay: ties reassembly, snapshots, routing and replication
//! together behind the operations the transport layer calls.
//!
//! ```text
//! packet ──► handle_fragment ──► ReassemblyEngine ──► Completed / Cleared
//!                                                          │
//!                                   SnapshotService ◄──────┤
//!                                                          ▼
//!                                                   BroadcastRouter ──► peers
//!
//! envelope ──► handle_replicated ──► snapshot update ──► BroadcastRouter (local only)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::protocol::{
    BroadcastEvent, ClientPacket, EventKind, Fragment, LogicalMessage, ReplicationEnvelope,
};
use crate::pusher::Pusher;
use crate::reassembly::{ReassemblyEngine, ReassemblyOutcome};
use crate::registry::{ConnectionRegistry, InMemoryConnectionRegistry};
use crate::replication::{CrossRegionReplicator, ReplicationBus};
use crate::router::{BroadcastRouter, RouteSummary};
use crate::snapshot::SnapshotService;
use crate::storage::{FragmentStore, InMemoryFragmentStore, InMemorySnapshotStore, SnapshotStore};

/// Lock-free relay counters.
#[derive(Debug, Default)]
struct AtomicRelayStats {
    fragments: AtomicU64,
    completions: AtomicU64,
    clears: AtomicU64,
    deliveries: AtomicU64,
    stale_targets: AtomicU64,
    replicated_out: AtomicU64,
    replicated_in: AtomicU64,
    replication_failures: AtomicU64,
}

/// Point-in-time copy of the relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub fragments: u64,
    pub completions: u64,
    pub clears: u64,
    pub deliveries: u64,
    pub stale_targets: u64,
    pub replicated_out: u64,
    pub replicated_in: u64,
    pub replication_failures: u64,
}

/// Entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub connections: usize,
    pub fragments: usize,
}

/// Collaborators a relay is built from.
pub struct RelayParts {
    pub region: String,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub fragments: Arc<dyn FragmentStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub pusher: Arc<dyn Pusher>,
    pub replicator: Option<Arc<CrossRegionReplicator>>,
    pub clock: Arc<dyn Clock>,
    pub fragment_ttl_secs: u64,
}

pub struct Relay {
    region: String,
    registry: Arc<dyn ConnectionRegistry>,
    fragments: Arc<dyn FragmentStore>,
    engine: ReassemblyEngine,
    router: BroadcastRouter,
    snapshots: SnapshotService,
    stats: AtomicRelayStats,
}

impl Relay {
    pub fn new(parts: RelayParts) -> Self {
        let engine = ReassemblyEngine::new(
            parts.fragments.clone(),
            parts.clock,
            parts.fragment_ttl_secs,
        );
        let router = BroadcastRouter::new(
            parts.registry.clone(),
            parts.pusher.clone(),
            parts.replicator,
        );
        let snapshots = SnapshotService::new(parts.snapshots, parts.pusher);
        Self {
            region: parts.region,
            registry: parts.registry,
            fragments: parts.fragments,
            engine,
            router,
            snapshots,
            stats: AtomicRelayStats::default(),
        }
    }

    /// Relay with in-memory stores, replicating to `peers`.
    pub fn in_memory(
        config: &RelayConfig,
        pusher: Arc<dyn Pusher>,
        peers: Vec<Arc<dyn ReplicationBus>>,
    ) -> Self {
        Self::in_memory_with_clock(config, pusher, peers, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(
        config: &RelayConfig,
        pusher: Arc<dyn Pusher>,
        peers: Vec<Arc<dyn ReplicationBus>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(RelayParts {
            region: config.region.clone(),
            registry: Arc::new(InMemoryConnectionRegistry::new(
                config.connection_ttl_secs,
                clock.clone(),
            )),
            fragments: Arc::new(InMemoryFragmentStore::new(clock.clone())),
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            pusher,
            replicator: replicator_for(&config.region, peers),
            clock,
            fragment_ttl_secs: config.fragment_ttl_secs,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &ReassemblyEngine {
        &self.engine
    }

    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    // ─── Connections ──────────────────────────────────────────

    pub async fn connect(&self, session_id: &str, connection_id: &str) -> Result<(), RelayError> {
        self.registry.join(session_id, connection_id).await
    }

    pub async fn disconnect(&self, session_id: &str, connection_id: &str) -> Result<(), RelayError> {
        self.registry.leave(session_id, connection_id).await
    }

    // ─── Inbound traffic ──────────────────────────────────────

    /// Decode a client packet received on `connection_id` and submit it.
    pub async fn handle_packet(
        &self,
        session_id: &str,
        connection_id: &str,
        packet: ClientPacket,
    ) -> Result<ReassemblyOutcome, RelayError> {
        let fragment = Fragment::from_packet(session_id, connection_id, packet)?;
        self.handle_fragment(fragment).await
    }

    /// Reassemble; on completion update the snapshot and route the event.
    pub async fn handle_fragment(&self, fragment: Fragment) -> Result<ReassemblyOutcome, RelayError> {
        self.stats.fragments.fetch_add(1, Ordering::Relaxed);
        let outcome = self.engine.submit_fragment(fragment).await?;

        match &outcome {
            ReassemblyOutcome::Incomplete => {}
            ReassemblyOutcome::Completed(message) => {
                self.stats.completions.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.snapshots.record(message).await {
                    log::error!("Failed to record snapshot of session {}: {e}", message.key.session_id);
                }
                self.route(&BroadcastEvent::completed(message, &self.region)).await;
            }
            ReassemblyOutcome::Cleared { message, .. } => {
                self.stats.completions.fetch_add(1, Ordering::Relaxed);
                self.stats.clears.fetch_add(1, Ordering::Relaxed);
                self.reset_snapshot(message).await;
                self.route(&BroadcastEvent::completed(message, &self.region)).await;
            }
        }
        Ok(outcome)
    }

    /// Send the session snapshot to the requesting connection.
    pub async fn handle_state_request(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<usize, RelayError> {
        self.snapshots.handle_state_request(connection_id, session_id).await
    }

    /// Apply an event delivered from a peer region and fan it out locally.
    ///
    /// Returns `None` when the envelope is not ours to handle.
    pub async fn handle_replicated(
        &self,
        envelope: &ReplicationEnvelope,
    ) -> Result<Option<RouteSummary>, RelayError> {
        if !envelope.is_whiteboard_event() {
            log::debug!(
                "Ignoring bus event {} / {}",
                envelope.source,
                envelope.detail_type
            );
            return Ok(None);
        }
        if envelope.detail.source_region == self.region {
            log::trace!("Ignoring own event {}", envelope.detail.message_id);
            return Ok(None);
        }

        let mut event = envelope.detail.clone();
        event.replicated = true;
        self.stats.replicated_in.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Received {} of session {} from {}",
            event.message_id,
            event.session_id,
            event.source_region
        );

        let message = event.to_message();
        match event.kind {
            EventKind::Clear => {
                self.stats.clears.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.engine.clear_session(&event.session_id).await {
                    log::error!("Replicated clear of session {} incomplete: {e}", event.session_id);
                }
                self.reset_snapshot(&message).await;
            }
            EventKind::Update => {
                if let Err(e) = self.snapshots.record(&message).await {
                    log::error!("Failed to record replicated snapshot of session {}: {e}", event.session_id);
                }
            }
        }

        Ok(Some(self.route(&event).await))
    }

    // ─── Maintenance ──────────────────────────────────────────

    /// Drop expired connections, fragments and completion markers.
    pub async fn sweep_expired(&self) -> Result<SweepReport, RelayError> {
        let connections = self.registry.purge_expired().await?;
        let fragments = self.fragments.purge_expired().await?;
        if connections + fragments > 0 {
            log::info!("Swept {connections} expired connections and {fragments} fragment records");
        }
        Ok(SweepReport {
            connections,
            fragments,
        })
    }

    pub fn stats(&self) -> RelayStats {
        let s = &self.stats;
        RelayStats {
            fragments: s.fragments.load(Ordering::Relaxed),
            completions: s.completions.load(Ordering::Relaxed),
            clears: s.clears.load(Ordering::Relaxed),
            deliveries: s.deliveries.load(Ordering::Relaxed),
            stale_targets: s.stale_targets.load(Ordering::Relaxed),
            replicated_out: s.replicated_out.load(Ordering::Relaxed),
            replicated_in: s.replicated_in.load(Ordering::Relaxed),
            replication_failures: s.replication_failures.load(Ordering::Relaxed),
        }
    }

    async fn route(&self, event: &BroadcastEvent) -> RouteSummary {
        let summary = self.router.route(event).await;
        let s = &self.stats;
        s.deliveries.fetch_add(summary.delivered as u64, Ordering::Relaxed);
        s.stale_targets.fetch_add(summary.stale.len() as u64, Ordering::Relaxed);
        s.replicated_out
            .fetch_add(summary.replication.published.len() as u64, Ordering::Relaxed);
        s.replication_failures
            .fetch_add(summary.replication.failures.len() as u64, Ordering::Relaxed);
        summary
    }

    async fn reset_snapshot(&self, message: &LogicalMessage) {
        if let Err(e) = self.snapshots.reset(&message.key.session_id).await {
            log::error!("Failed to reset snapshot of session {}: {e}", message.key.session_id);
        }
    }
}

/// Replicator for `region`, or `None` when there is nobody to replicate to.
pub fn replicator_for(
    region: &str,
    peers: Vec<Arc<dyn ReplicationBus>>,
) -> Option<Arc<CrossRegionReplicator>> {
    let replicator = CrossRegionReplicator::new(region, peers);
    if replicator.peer_regions().is_empty() {
        None
    } else {
        Some(Arc::new(replicator))
    }
}

/// Feed envelopes from a bus subscription into `relay` until the bus closes.
pub fn spawn_bus_listener(
    relay: Arc<Relay>,
    mut rx: broadcast::Receiver<Arc<ReplicationEnvelope>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if let Err(e) = relay.handle_replicated(&envelope).await {
                        log::error!("Region {} failed to apply replicated event: {e}", relay.region());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Region {} lagged by {n} replicated events", relay.region());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::{DeliveredPacket, MessageKey, CLEAR_COMMAND};
    use crate::pusher::ChannelPusher;
    use crate::replication::LocalBus;
    use tokio::sync::mpsc;

    struct Harness {
        relay: Relay,
        pusher: Arc<ChannelPusher>,
        clock: Arc<ManualClock>,
    }

    fn harness(peers: Vec<Arc<dyn ReplicationBus>>) -> Harness {
        let pusher = Arc::new(ChannelPusher::new(16));
        let clock = Arc::new(ManualClock::new(1_000));
        let relay = Relay::in_memory_with_clock(
            &RelayConfig::for_testing(),
            pusher.clone(),
            peers,
            clock.clone(),
        );
        Harness { relay, pusher, clock }
    }

    impl Harness {
        async fn attach(&self, session: &str, connection: &str) -> mpsc::Receiver<Arc<Vec<u8>>> {
            let rx = self.pusher.register(connection).await;
            self.relay.connect(session, connection).await.unwrap();
            rx
        }
    }

    fn next_packet(rx: &mut mpsc::Receiver<Arc<Vec<u8>>>) -> DeliveredPacket {
        let bytes = rx.try_recv().unwrap();
        DeliveredPacket::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_sender_excluded_and_snapshot_updated() {
        let h = harness(Vec::new());
        let mut a = h.attach("S", "A").await;
        let mut b = h.attach("S", "B").await;
        let mut c = h.attach("S", "C").await;

        let key = MessageKey::new("S", "A", "m1");
        h.relay.handle_fragment(Fragment::data(key.clone(), 1, "AB")).await.unwrap();
        h.relay.handle_fragment(Fragment::metadata(key.clone(), 2)).await.unwrap();
        let outcome = h.relay.handle_fragment(Fragment::data(key, 2, "CD")).await.unwrap();
        assert!(outcome.is_completion());

        for rx in [&mut b, &mut c] {
            let packet = next_packet(rx);
            assert_eq!(packet.sender, "A");
            assert_eq!(packet.packet_id, "m1");
            assert_eq!(packet.contents, "ABCD");
        }
        assert!(a.try_recv().is_err());

        let state = h.relay.snapshots().get_state("S").await.unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].payload, b"ABCD");

        let stats = h.relay.stats();
        assert_eq!(stats.fragments, 3);
        assert_eq!(stats.completions, 1);
        assert_eq!(stats.deliveries, 2);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_state() {
        let h = harness(Vec::new());
        let _a = h.attach("S", "A").await;
        let key = MessageKey::new("S", "A", "m1");
        h.relay.handle_fragment(Fragment::metadata(key.clone(), 1)).await.unwrap();
        h.relay.handle_fragment(Fragment::data(key, 1, "ABCD")).await.unwrap();

        let mut d = h.attach("S", "D").await;
        assert_eq!(h.relay.handle_state_request("D", "S").await.unwrap(), 1);
        assert_eq!(next_packet(&mut d).contents, "ABCD");
    }

    #[tokio::test]
    async fn test_clear_resets_snapshot_and_broadcasts() {
        let h = harness(Vec::new());
        let _a = h.attach("S", "A").await;
        let mut b = h.attach("S", "B").await;

        let m1 = MessageKey::new("S", "A", "m1");
        h.relay.handle_fragment(Fragment::metadata(m1.clone(), 1)).await.unwrap();
        h.relay.handle_fragment(Fragment::data(m1, 1, "ABCD")).await.unwrap();
        let _ = next_packet(&mut b);

        let wipe = MessageKey::new("S", "A", "wipe");
        h.relay.handle_fragment(Fragment::metadata(wipe.clone(), 1)).await.unwrap();
        let outcome = h
            .relay
            .handle_fragment(Fragment::data(wipe, 1, CLEAR_COMMAND))
            .await
            .unwrap();
        assert!(matches!(outcome, ReassemblyOutcome::Cleared { .. }));

        assert!(next_packet(&mut b).is_clear());
        assert!(h.relay.snapshots().get_state("S").await.unwrap().is_empty());
        assert_eq!(h.relay.stats().clears, 1);
    }

    #[tokio::test]
    async fn test_invalid_packet_rejected() {
        let h = harness(Vec::new());
        let packet = ClientPacket {
            packet_id: "m1".into(),
            packet_num: -3,
            packet_count: 0,
            contents: String::new(),
        };
        let err = h.relay.handle_packet("S", "A", packet).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidFragment(_)));
        assert_eq!(h.relay.stats().fragments, 0);
    }

    #[tokio::test]
    async fn test_replicated_event_delivered_locally_only() {
        let peer = Arc::new(LocalBus::new("us-east-1", 16));
        let _peer_rx = peer.subscribe();
        let h = harness(vec![peer.clone()]);
        let mut b = h.attach("S", "B").await;

        let origin = BroadcastEvent::completed(
            &LogicalMessage {
                key: MessageKey::new("S", "A", "m1"),
                fragment_count: 2,
                payload: b"ABCD".to_vec(),
            },
            "ap-south-1",
        );
        let summary = h
            .relay
            .handle_replicated(&ReplicationEnvelope::wrap(&origin))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.delivered, 1);
        assert!(summary.replication.published.is_empty());
        assert_eq!(peer.published(), 0);
        assert_eq!(next_packet(&mut b).contents, "ABCD");
        assert_eq!(h.relay.snapshots().get_state("S").await.unwrap().len(), 1);
        assert_eq!(h.relay.stats().replicated_in, 1);
    }

    #[tokio::test]
    async fn test_own_and_foreign_envelopes_ignored() {
        let h = harness(Vec::new());
        let mut b = h.attach("S", "B").await;
        let message = LogicalMessage {
            key: MessageKey::new("S", "A", "m1"),
            fragment_count: 1,
            payload: b"x".to_vec(),
        };

        let own = ReplicationEnvelope::wrap(&BroadcastEvent::completed(&message, h.relay.region()));
        assert!(h.relay.handle_replicated(&own).await.unwrap().is_none());

        let mut foreign = ReplicationEnvelope::wrap(&BroadcastEvent::completed(&message, "us-east-1"));
        foreign.detail_type = "SomethingElse".into();
        assert!(h.relay.handle_replicated(&foreign).await.unwrap().is_none());

        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replicated_clear_wipes_local_fragments() {
        let h = harness(Vec::new());
        let pending = MessageKey::new("S", "B", "half");
        h.relay.handle_fragment(Fragment::metadata(pending.clone(), 2)).await.unwrap();
        h.relay.handle_fragment(Fragment::data(pending.clone(), 1, "xx")).await.unwrap();

        let clear = BroadcastEvent::completed(
            &LogicalMessage {
                key: MessageKey::new("S", "A", "wipe"),
                fragment_count: 1,
                payload: CLEAR_COMMAND.to_vec(),
            },
            "us-east-1",
        );
        h.relay.handle_replicated(&ReplicationEnvelope::wrap(&clear)).await.unwrap();
        assert_eq!(h.relay.engine().pending_fragments(&pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let h = harness(Vec::new());
        let _a = h.attach("S", "A").await;
        let key = MessageKey::new("S", "A", "m1");
        h.relay.handle_fragment(Fragment::data(key, 1, "AB")).await.unwrap();

        h.clock.advance(3_601);
        let report = h.relay.sweep_expired().await.unwrap();
        assert_eq!(report.connections, 1);
        assert_eq!(report.fragments, 1);
        assert!(h.relay.registry().list_by_session("S").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bus_listener_applies_envelopes() {
        let bus = Arc::new(LocalBus::new("eu-west-2", 16));
        let h = harness(Vec::new());
        let mut b = h.attach("S", "B").await;
        let relay = Arc::new(h.relay);
        let listener = spawn_bus_listener(relay.clone(), bus.subscribe());

        let event = BroadcastEvent::completed(
            &LogicalMessage {
                key: MessageKey::new("S", "A", "m9"),
                fragment_count: 1,
                payload: b"hi".to_vec(),
            },
            "sa-east-1",
        );
        bus.publish(&ReplicationEnvelope::wrap(&event)).await.unwrap();

        let bytes = tokio::time::timeout(std::time::Duration::from_secs(2), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(DeliveredPacket::decode(&bytes).unwrap().contents, "hi");
        listener.abort();
    }
}
