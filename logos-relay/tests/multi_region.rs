//! Multi-region tests: one-hop replication between regional relays.
//!
//! In-process regions share `LocalBus`es; the last test wires two real
//! servers together over their `/replication` endpoints.

use std::sync::Arc;

use logos_relay::client::{RelayClient, RelayEvent};
use logos_relay::protocol::{DeliveredPacket, Fragment, MessageKey, CLEAR_COMMAND};
use logos_relay::pusher::ChannelPusher;
use logos_relay::relay::{spawn_bus_listener, Relay};
use logos_relay::replication::{LocalBus, ReplicationBus};
use logos_relay::server::RelayServer;
use logos_relay::{PeerRegion, RelayConfig};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const REGIONS: [&str; 4] = ["eu-west-2", "us-east-1", "ap-south-1", "sa-east-1"];

struct Region {
    relay: Arc<Relay>,
    pusher: Arc<ChannelPusher>,
}

impl Region {
    async fn attach(&self, session: &str, connection: &str) -> mpsc::Receiver<Arc<Vec<u8>>> {
        let rx = self.pusher.register(connection).await;
        self.relay.connect(session, connection).await.unwrap();
        rx
    }
}

/// Every region subscribes to its own bus and publishes to everyone else's.
fn mesh() -> Vec<Region> {
    let buses: Vec<Arc<LocalBus>> = REGIONS.iter().map(|r| Arc::new(LocalBus::new(*r, 64))).collect();

    buses
        .iter()
        .map(|own| {
            let peers: Vec<Arc<dyn ReplicationBus>> = buses
                .iter()
                .filter(|b| b.region() != own.region())
                .map(|b| b.clone() as Arc<dyn ReplicationBus>)
                .collect();
            let config = RelayConfig {
                region: own.region().to_string(),
                ..RelayConfig::for_testing()
            };
            let pusher = Arc::new(ChannelPusher::new(64));
            let relay = Arc::new(Relay::in_memory(&config, pusher.clone(), peers));
            spawn_bus_listener(relay.clone(), own.subscribe());
            Region { relay, pusher }
        })
        .collect()
}

async fn recv_packet(rx: &mut mpsc::Receiver<Arc<Vec<u8>>>) -> DeliveredPacket {
    let bytes = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("packet within timeout")
        .expect("outbox open");
    DeliveredPacket::decode(&bytes).unwrap()
}

async fn assert_no_packet(rx: &mut mpsc::Receiver<Arc<Vec<u8>>>) {
    let got = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(got.is_err(), "expected no packet");
}

async fn complete(relay: &Relay, sender: &str, id: &str, payload: &[u8]) {
    let key = MessageKey::new("S", sender, id);
    relay.handle_fragment(Fragment::metadata(key.clone(), 1)).await.unwrap();
    let outcome = relay.handle_fragment(Fragment::data(key, 1, payload)).await.unwrap();
    assert!(outcome.is_completion());
}

#[tokio::test]
async fn test_update_replicated_to_every_region_once() {
    let regions = mesh();
    let _a = regions[0].attach("S", "A").await;
    let mut b = regions[0].attach("S", "B").await;
    let mut remote = Vec::new();
    for (i, region) in regions.iter().enumerate().skip(1) {
        remote.push(region.attach("S", &format!("R{i}")).await);
    }

    complete(&regions[0].relay, "A", "m1", b"ABCD").await;

    assert_eq!(recv_packet(&mut b).await.contents, "ABCD");
    for rx in remote.iter_mut() {
        let packet = recv_packet(rx).await;
        assert_eq!(packet.contents, "ABCD");
        assert_eq!(packet.sender, "A");
    }

    // One hop: nothing bounces back or travels further
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_no_packet(&mut b).await;
    for rx in remote.iter_mut() {
        assert_no_packet(rx).await;
    }

    let origin = regions[0].relay.stats();
    assert_eq!(origin.replicated_out, 3);
    assert_eq!(origin.replicated_in, 0);
    for region in &regions[1..] {
        let stats = region.relay.stats();
        assert_eq!(stats.replicated_in, 1);
        assert_eq!(stats.replicated_out, 0);
    }
}

#[tokio::test]
async fn test_replicated_update_feeds_remote_snapshot() {
    let regions = mesh();
    let _a = regions[0].attach("S", "A").await;
    let mut watcher = regions[2].attach("S", "W").await;

    complete(&regions[0].relay, "A", "m1", b"ABCD").await;
    let _ = recv_packet(&mut watcher).await;

    let mut late = regions[2].attach("S", "D").await;
    assert_eq!(regions[2].relay.handle_state_request("D", "S").await.unwrap(), 1);
    assert_eq!(recv_packet(&mut late).await.contents, "ABCD");
}

#[tokio::test]
async fn test_clear_replicates_and_resets_remote_state() {
    let regions = mesh();
    let _a = regions[0].attach("S", "A").await;
    let mut remote = regions[1].attach("S", "B").await;

    complete(&regions[0].relay, "A", "m1", b"ABCD").await;
    let _ = recv_packet(&mut remote).await;

    complete(&regions[0].relay, "A", "wipe", CLEAR_COMMAND).await;
    assert!(recv_packet(&mut remote).await.is_clear());
    assert!(regions[1].relay.snapshots().get_state("S").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replication_over_websocket_links() {
    // Region B first, so A can be pointed at it
    let listener_b = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_b = listener_b.local_addr().unwrap().port();
    let server_b = RelayServer::new(RelayConfig {
        region: "us-east-1".into(),
        ..RelayConfig::for_testing()
    })
    .unwrap();
    tokio::spawn(async move {
        let _ = server_b.serve(listener_b).await;
    });

    let listener_a = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    let server_a = RelayServer::new(RelayConfig {
        region: "eu-west-2".into(),
        peers: vec![PeerRegion {
            region: "us-east-1".into(),
            url: format!("ws://127.0.0.1:{port_b}"),
        }],
        ..RelayConfig::for_testing()
    })
    .unwrap();
    tokio::spawn(async move {
        let _ = server_a.serve(listener_a).await;
    });

    let mut alice = RelayClient::new(format!("ws://127.0.0.1:{port_a}"), "S", 4);
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    let mut bob = RelayClient::new(format!("ws://127.0.0.1:{port_b}"), "S", 4);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    assert!(matches!(alice_events.recv().await, Some(RelayEvent::Connected)));
    assert!(matches!(bob_events.recv().await, Some(RelayEvent::Connected)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.send_update("across the ocean").await.unwrap();

    match timeout(Duration::from_secs(3), bob_events.recv()).await {
        Ok(Some(RelayEvent::Update(p))) => assert_eq!(p.contents, "across the ocean"),
        other => panic!("Expected replicated Update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_silent_peer_region_does_not_stall_local_delivery() {
    // Completes TCP through the backlog, never answers the WebSocket handshake
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_port = silent.local_addr().unwrap().port();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = RelayServer::new(RelayConfig {
        peers: vec![PeerRegion {
            region: "us-east-1".into(),
            url: format!("ws://127.0.0.1:{silent_port}"),
        }],
        ..RelayConfig::for_testing()
    })
    .unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let mut alice = RelayClient::new(format!("ws://127.0.0.1:{port}"), "S", 4);
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    let mut bob = RelayClient::new(format!("ws://127.0.0.1:{port}"), "S", 4);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    assert!(matches!(alice_events.recv().await, Some(RelayEvent::Connected)));
    assert!(matches!(bob_events.recv().await, Some(RelayEvent::Connected)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    for round in 0..3 {
        let hello = format!("hello {round}");
        alice.send_update(&hello).await.unwrap();
        match timeout(Duration::from_secs(1), bob_events.recv()).await {
            Ok(Some(RelayEvent::Update(p))) => assert_eq!(p.contents, hello),
            other => panic!("Expected Update for bob, got {other:?}"),
        }

        let reply = format!("reply {round}");
        bob.send_update(&reply).await.unwrap();
        match timeout(Duration::from_secs(1), alice_events.recv()).await {
            Ok(Some(RelayEvent::Update(p))) => assert_eq!(p.contents, reply),
            other => panic!("Expected Update for alice, got {other:?}"),
        }
    }
    drop(silent);
}
