//! Persistence integration tests.
//!
//! Verifies:
//! - Session snapshots survive a relay restart
//! - Partially received messages complete after a restart
//! - Completion markers outlive restarts, so late duplicates stay silent
//! - Fragment expiry through the full relay stack

use std::sync::Arc;

use logos_relay::clock::ManualClock;
use logos_relay::protocol::{Fragment, MessageKey};
use logos_relay::pusher::ChannelPusher;
use logos_relay::reassembly::ReassemblyOutcome;
use logos_relay::registry::InMemoryConnectionRegistry;
use logos_relay::relay::{Relay, RelayParts};
use logos_relay::storage::{RocksStore, StoreConfig};
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn relay_on(path: &std::path::Path, clock: Arc<ManualClock>) -> (Relay, Arc<ChannelPusher>) {
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(path), clock.clone()).unwrap());
    let pusher = Arc::new(ChannelPusher::new(16));
    let relay = Relay::new(RelayParts {
        region: "eu-west-2".into(),
        registry: Arc::new(InMemoryConnectionRegistry::new(3600, clock.clone())),
        fragments: store.clone(),
        snapshots: store,
        pusher: pusher.clone(),
        replicator: None,
        clock,
        fragment_ttl_secs: 3600,
    });
    (relay, pusher)
}

fn key(id: &str) -> MessageKey {
    MessageKey::new("S", "A", id)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));

    {
        let (relay, _pusher) = relay_on(dir.path(), clock.clone());
        relay.handle_fragment(Fragment::metadata(key("m1"), 2)).await.unwrap();
        relay.handle_fragment(Fragment::data(key("m1"), 1, "AB")).await.unwrap();
        let outcome = relay.handle_fragment(Fragment::data(key("m1"), 2, "CD")).await.unwrap();
        assert!(outcome.is_completion());
    }

    let (relay, pusher) = relay_on(dir.path(), clock);
    let state = relay.snapshots().get_state("S").await.unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state[0].payload, b"ABCD");

    let mut rx = pusher.register("D").await;
    relay.connect("S", "D").await.unwrap();
    assert_eq!(relay.handle_state_request("D", "S").await.unwrap(), 1);
    let bytes = rx.recv().await.unwrap();
    let packet = logos_relay::DeliveredPacket::decode(&bytes).unwrap();
    assert_eq!(packet.contents, "ABCD");
}

#[tokio::test]
async fn test_partial_message_completes_after_restart() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));

    {
        let (relay, _pusher) = relay_on(dir.path(), clock.clone());
        relay.handle_fragment(Fragment::data(key("m1"), 2, "CD")).await.unwrap();
        relay.handle_fragment(Fragment::metadata(key("m1"), 2)).await.unwrap();
    }

    let (relay, _pusher) = relay_on(dir.path(), clock);
    assert_eq!(relay.engine().pending_fragments(&key("m1")).await.unwrap(), 1);
    match relay.handle_fragment(Fragment::data(key("m1"), 1, "AB")).await.unwrap() {
        ReassemblyOutcome::Completed(message) => assert_eq!(message.payload, b"ABCD"),
        other => panic!("Expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_completion_marker_survives_restart() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));

    {
        let (relay, _pusher) = relay_on(dir.path(), clock.clone());
        relay.handle_fragment(Fragment::metadata(key("m1"), 1)).await.unwrap();
        relay.handle_fragment(Fragment::data(key("m1"), 1, "x")).await.unwrap();
    }

    let (relay, _pusher) = relay_on(dir.path(), clock);
    relay.handle_fragment(Fragment::metadata(key("m1"), 1)).await.unwrap();
    let outcome = relay.handle_fragment(Fragment::data(key("m1"), 1, "x")).await.unwrap();
    assert_eq!(outcome, ReassemblyOutcome::Incomplete);
    assert_eq!(relay.stats().completions, 0);
}

#[tokio::test]
async fn test_expired_fragments_swept() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let (relay, _pusher) = relay_on(dir.path(), clock.clone());

    relay.handle_fragment(Fragment::metadata(key("stale"), 3)).await.unwrap();
    relay.handle_fragment(Fragment::data(key("stale"), 1, "a")).await.unwrap();

    clock.advance(3_601);
    assert_eq!(relay.engine().pending_fragments(&key("stale")).await.unwrap(), 0);
    let report = relay.sweep_expired().await.unwrap();
    assert_eq!(report.fragments, 2);

    // A fresh attempt at the same id starts from scratch
    relay.handle_fragment(Fragment::metadata(key("stale"), 1)).await.unwrap();
    let outcome = relay.handle_fragment(Fragment::data(key("stale"), 1, "b")).await.unwrap();
    assert!(outcome.is_completion());
}
