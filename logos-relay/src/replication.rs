//! One-hop cross-region replication of completed events.
//!
//! ```text
//!   region A                               region B
//! ┌───────────┐  ReplicationEnvelope   ┌───────────────┐
//! │ Router    │ ─────────────────────► │ bus / peer    │──► Relay::handle_replicated
//! │ (local    │   replicated = true    │ link listener │      (local fan-out only)
//! │  origin)  │ ──────────┐            └───────────────┘
//! └───────────┘           │            ┌───────────────┐
//!                         └──────────► │ region C ...  │
//!                                      └───────────────┘
//! ```
//!
//! Every peer is published to independently and under a timeout; one
//! unreachable region never delays or cancels delivery to the others.
//! Duplicated deliveries are not filtered: the receiving region simply fans
//! the payload out again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::RelayError;
use crate::protocol::{BroadcastEvent, ReplicationEnvelope};

/// Path on which a relay accepts envelopes from peer regions.
pub const REPLICATION_PATH: &str = "/replication";

/// A region's inbound event bus, seen from the publishing side.
#[async_trait]
pub trait ReplicationBus: Send + Sync {
    /// Region this bus delivers into.
    fn region(&self) -> &str;

    async fn publish(&self, envelope: &ReplicationEnvelope) -> Result<(), RelayError>;
}

/// In-process bus backed by a tokio broadcast channel.
pub struct LocalBus {
    region: String,
    sender: broadcast::Sender<Arc<ReplicationEnvelope>>,
    published: AtomicU64,
}

impl LocalBus {
    pub fn new(region: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            region: region.into(),
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Register a subscriber; every envelope published afterwards reaches it.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ReplicationEnvelope>> {
        self.sender.subscribe()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReplicationBus for LocalBus {
    fn region(&self) -> &str {
        &self.region
    }

    async fn publish(&self, envelope: &ReplicationEnvelope) -> Result<(), RelayError> {
        self.sender
            .send(Arc::new(envelope.clone()))
            .map_err(|_| RelayError::ReplicationFailure {
                region: self.region.clone(),
                reason: "no subscribers".into(),
            })?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

type PeerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Envelopes that may wait for a peer link before publishes are refused.
pub const PEER_QUEUE_CAPACITY: usize = 1024;

/// Upper bound on opening a peer link or writing one frame to it.
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery counters of one peer link.
#[derive(Debug, Default)]
pub struct LinkStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl LinkStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Envelopes given up on after a failed connect or send.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Bus that forwards envelopes to a peer region's relay over WebSocket.
///
/// `publish` only enqueues. A link task owns the socket: it opens it lazily,
/// reopens it once per envelope after a failure, and bounds every connect
/// and send by the link timeout. A slow or dead peer therefore fills its own
/// queue and nothing else.
pub struct PeerLinkBus {
    region: String,
    url: String,
    link_timeout: Duration,
    queue: mpsc::Sender<String>,
    // Taken by the first publish, which starts the link task
    pending: Mutex<Option<mpsc::Receiver<String>>>,
    stats: Arc<LinkStats>,
}

impl PeerLinkBus {
    /// `url` is the peer relay's base WebSocket URL, e.g. `ws://10.0.0.2:9090`.
    pub fn new(region: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let url = format!("{}{REPLICATION_PATH}", url.trim_end_matches('/'));
        let (queue, pending) = mpsc::channel(PEER_QUEUE_CAPACITY);
        Self {
            region: region.into(),
            url,
            link_timeout: DEFAULT_LINK_TIMEOUT,
            queue,
            pending: Mutex::new(Some(pending)),
            stats: Arc::new(LinkStats::default()),
        }
    }

    pub fn with_link_timeout(mut self, link_timeout: Duration) -> Self {
        self.link_timeout = link_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    fn failure(&self, reason: impl std::fmt::Display) -> RelayError {
        RelayError::ReplicationFailure {
            region: self.region.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ReplicationBus for PeerLinkBus {
    fn region(&self) -> &str {
        &self.region
    }

    async fn publish(&self, envelope: &ReplicationEnvelope) -> Result<(), RelayError> {
        let text = envelope.encode()?;

        if let Some(queue) = self.pending.lock().await.take() {
            let link = PeerLink {
                region: self.region.clone(),
                url: self.url.clone(),
                link_timeout: self.link_timeout,
                stats: self.stats.clone(),
            };
            tokio::spawn(link.run(queue));
        }

        self.queue.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => self.failure("link queue full"),
            mpsc::error::TrySendError::Closed(_) => self.failure("link task stopped"),
        })
    }
}

/// Socket side of a [`PeerLinkBus`]; runs until the bus is dropped.
struct PeerLink {
    region: String,
    url: String,
    link_timeout: Duration,
    stats: Arc<LinkStats>,
}

impl PeerLink {
    async fn run(self, mut queue: mpsc::Receiver<String>) {
        let mut socket: Option<PeerSocket> = None;

        while let Some(text) = queue.recv().await {
            if let Some(open) = socket.as_mut() {
                let sent = timeout(self.link_timeout, open.send(Message::Text(text.clone().into())));
                match sent.await {
                    Ok(Ok(())) => {
                        self.stats.sent.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Ok(Err(e)) => {
                        log::warn!("Replication link to {} broke, reconnecting: {e}", self.region)
                    }
                    Err(_) => log::warn!("Replication link to {} stalled, reconnecting", self.region),
                }
                socket = None;
            }

            match self.open_and_send(text).await {
                Ok(open) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                    socket = Some(open);
                }
                Err(reason) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropping envelope for {}: {reason}", self.region);
                }
            }
        }

        log::debug!("Replication link to {} shut down", self.region);
    }

    async fn open_and_send(&self, text: String) -> Result<PeerSocket, String> {
        let connecting = tokio_tungstenite::connect_async(self.url.as_str());
        let (mut socket, _) = timeout(self.link_timeout, connecting)
            .await
            .map_err(|_| format!("connect to {} timed out", self.url))?
            .map_err(|e| e.to_string())?;
        log::info!("Opened replication link to {} at {}", self.region, self.url);

        timeout(self.link_timeout, socket.send(Message::Text(text.into())))
            .await
            .map_err(|_| "send timed out".to_string())?
            .map_err(|e| e.to_string())?;
        Ok(socket)
    }
}

/// Outcome of one replication fan-out.
#[derive(Debug, Default)]
pub struct ReplicationReport {
    /// Regions that accepted the envelope
    pub published: Vec<String>,
    pub failures: Vec<RelayError>,
}

/// How long one peer's `publish` may take before it counts as failed.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Publishes locally-originated events to every peer region.
pub struct CrossRegionReplicator {
    local_region: String,
    peers: Vec<Arc<dyn ReplicationBus>>,
    publish_timeout: Duration,
}

impl CrossRegionReplicator {
    pub fn new(local_region: impl Into<String>, peers: Vec<Arc<dyn ReplicationBus>>) -> Self {
        let local_region = local_region.into();
        let peers: Vec<Arc<dyn ReplicationBus>> = peers
            .into_iter()
            .filter(|p| p.region() != local_region)
            .collect();
        Self {
            local_region,
            peers,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn peer_regions(&self) -> Vec<&str> {
        self.peers.iter().map(|p| p.region()).collect()
    }

    /// Publish `event`, tagged replicated, to every peer concurrently.
    ///
    /// Events that are themselves replicas are never forwarded again.
    pub async fn replicate(&self, event: &BroadcastEvent) -> ReplicationReport {
        if event.replicated {
            log::debug!("Not re-replicating event {} from {}", event.message_id, event.source_region);
            return ReplicationReport::default();
        }

        let envelope = ReplicationEnvelope::wrap(event);
        let results = join_all(self.peers.iter().map(|peer| {
            let envelope = &envelope;
            async move {
                let region = peer.region().to_string();
                let result = match timeout(self.publish_timeout, peer.publish(envelope)).await {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::ReplicationFailure {
                        region: region.clone(),
                        reason: "publish timed out".into(),
                    }),
                };
                (region, result)
            }
        }))
        .await;

        let mut report = ReplicationReport::default();
        for (region, result) in results {
            match result {
                Ok(()) => report.published.push(region),
                Err(e) => {
                    log::warn!("Replication from {} to {region} failed: {e}", self.local_region);
                    report.failures.push(e);
                }
            }
        }
        report
    }
}
