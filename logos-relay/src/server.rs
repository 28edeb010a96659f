//! WebSocket relay server with session-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /?session=S                     ┌── outbox ──► Client B
//!            ├──────────────► Relay (region) ───┤
//! Client B ──┘                   │              └── outbox ──► Client C
//!                                │
//!                                ├── FragmentStore / SnapshotStore
//!                                │       (memory or RocksDB)
//!                                │
//!                                └── PeerLinkBus ──► /replication on peer regions
//!
//! Peer region ── /replication ──► Relay::handle_replicated
//! ```
//!
//! Each client connection gets:
//! - a connection id (UUID v4), used as the sender id of its fragments
//! - a registry entry in the session named by its `session` query parameter
//! - a bounded outbox drained into its socket

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::protocol::{ClientAction, ClientFrame, ReplicationEnvelope};
use crate::pusher::ChannelPusher;
use crate::reassembly::ReassemblyOutcome;
use crate::registry::InMemoryConnectionRegistry;
use crate::relay::{replicator_for, Relay, RelayParts};
use crate::replication::{PeerLinkBus, ReplicationBus, REPLICATION_PATH};
use crate::storage::{
    FragmentStore, InMemoryFragmentStore, InMemorySnapshotStore, RocksStore, SnapshotStore,
    StoreConfig,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub replication_links: u64,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    relay: Arc<Relay>,
    pusher: Arc<ChannelPusher>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Build a relay from configuration: RocksDB when a storage path is set,
    /// in-memory stores otherwise, and one WebSocket link per peer region.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pusher = Arc::new(ChannelPusher::new(config.outbound_capacity));
        let peers: Vec<Arc<dyn ReplicationBus>> = config
            .peers
            .iter()
            .map(|p| Arc::new(PeerLinkBus::new(&p.region, &p.url)) as Arc<dyn ReplicationBus>)
            .collect();

        let fragments: Arc<dyn FragmentStore>;
        let snapshots: Arc<dyn SnapshotStore>;
        match &config.storage_path {
            Some(path) => {
                let store = Arc::new(RocksStore::open(
                    StoreConfig {
                        path: path.clone(),
                        ..StoreConfig::default()
                    },
                    clock.clone(),
                )?);
                log::info!("Using persistent store at {}", store.path().display());
                fragments = store.clone();
                snapshots = store;
            }
            None => {
                fragments = Arc::new(InMemoryFragmentStore::new(clock.clone()));
                snapshots = Arc::new(InMemorySnapshotStore::new());
            }
        }

        let relay = Relay::new(RelayParts {
            region: config.region.clone(),
            registry: Arc::new(InMemoryConnectionRegistry::new(
                config.connection_ttl_secs,
                clock.clone(),
            )),
            fragments,
            snapshots,
            pusher: pusher.clone(),
            replicator: replicator_for(&config.region, peers),
            clock,
            fragment_ttl_secs: config.fragment_ttl_secs,
        });

        Ok(Self::with_relay(config, Arc::new(relay), pusher))
    }

    /// Serve an already-built relay; `pusher` must be the one it pushes through.
    pub fn with_relay(config: RelayConfig, relay: Arc<Relay>, pusher: Arc<ChannelPusher>) -> Self {
        Self {
            config,
            relay,
            pusher,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!(
            "Relay for {} listening on {}",
            self.relay.region(),
            listener.local_addr()?
        );
        let sweeper = self.spawn_sweeper();

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let pusher = self.pusher.clone();
            let stats = self.stats.clone();
            let default_session = self.config.default_session.clone();
            let refresh_every = self.refresh_interval();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream,
                    addr,
                    relay,
                    pusher,
                    stats,
                    default_session,
                    refresh_every,
                )
                .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    /// How often an open client socket renews its registry entry: twice per TTL.
    fn refresh_interval(&self) -> Duration {
        Duration::from_secs((self.config.connection_ttl_secs / 2).max(1))
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let relay = self.relay.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = relay.sweep_expired().await {
                    log::error!("Expiry sweep failed: {e}");
                }
            }
        })
    }

    /// Complete the handshake and dispatch on the request path.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<Relay>,
        pusher: Arc<ChannelPusher>,
        stats: Arc<RwLock<ServerStats>>,
        default_session: String,
        refresh_every: Duration,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let mut query = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = req.uri().path().to_string();
                query = req.uri().query().map(str::to_string);
                Ok(response)
            },
        )
        .await?;

        if path == REPLICATION_PATH {
            stats.write().await.replication_links += 1;
            return Self::handle_replication_link(ws_stream, addr, relay).await;
        }

        let session_id = query
            .as_deref()
            .and_then(|q| query_param(q, "session"))
            .filter(|s| !s.is_empty())
            .unwrap_or(default_session);
        Self::handle_client(ws_stream, addr, session_id, relay, pusher, stats, refresh_every).await
    }

    /// A client socket: fragments and state requests in, routed packets out.
    async fn handle_client(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        session_id: String,
        relay: Arc<Relay>,
        pusher: Arc<ChannelPusher>,
        stats: Arc<RwLock<ServerStats>>,
        refresh_every: Duration,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = Uuid::new_v4().to_string();

        let mut outbox = pusher.register(&connection_id).await;
        relay.connect(&session_id, &connection_id).await?;
        log::info!("Connection {connection_id} from {addr} joined session {session_id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // An open socket keeps its registry entry alive
        let mut refresh = tokio::time::interval(refresh_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                                Ok(text) => text.to_string(),
                                Err(_) => {
                                    log::warn!("Non-UTF-8 binary frame from {connection_id}");
                                    stats.write().await.rejected_frames += 1;
                                    continue;
                                }
                            },
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {connection_id} closed");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += text.len() as u64;
                        }

                        if !Self::dispatch_frame(&relay, &session_id, &connection_id, &text).await {
                            stats.write().await.rejected_frames += 1;
                        }
                    }

                    _ = refresh.tick() => {
                        if let Err(e) = relay.connect(&session_id, &connection_id).await {
                            log::warn!("Failed to refresh {connection_id} in session {session_id}: {e}");
                        }
                    }

                    bytes = outbox.recv() => {
                        match bytes {
                            Some(bytes) => {
                                let text = String::from_utf8_lossy(&bytes).into_owned();
                                ws_sender.send(Message::Text(text.into())).await?;
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup
        pusher.unregister(&connection_id).await;
        if let Err(e) = relay.disconnect(&session_id, &connection_id).await {
            log::warn!("Failed to remove {connection_id} from session {session_id}: {e}");
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {connection_id} left session {session_id}");

        result
    }

    /// Handle one client frame. Returns false if it was rejected.
    async fn dispatch_frame(relay: &Relay, session_id: &str, connection_id: &str, text: &str) -> bool {
        let frame = match ClientFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to decode frame from {connection_id}: {e}");
                return false;
            }
        };

        match frame {
            ClientFrame::Action {
                action: ClientAction::GetState,
            } => match relay.handle_state_request(connection_id, session_id).await {
                Ok(sent) => {
                    log::debug!("Served {sent} snapshot packets to {connection_id}");
                    true
                }
                Err(e) => {
                    log::error!("State request from {connection_id} failed: {e}");
                    false
                }
            },
            ClientFrame::Packet(packet) => {
                match relay.handle_packet(session_id, connection_id, packet).await {
                    Ok(ReassemblyOutcome::Incomplete) => true,
                    Ok(_) => {
                        log::trace!("Frame from {connection_id} completed a message");
                        true
                    }
                    Err(e @ RelayError::InvalidFragment(_)) => {
                        log::warn!("Rejected fragment from {connection_id}: {e}");
                        false
                    }
                    Err(e) => {
                        log::error!("Fragment from {connection_id} failed: {e}");
                        false
                    }
                }
            }
        }
    }

    /// A peer region's replication link: envelopes in, nothing out.
    async fn handle_replication_link(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        relay: Arc<Relay>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("Replication link established from {addr}");

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match ReplicationEnvelope::decode(text.as_str()) {
                    Ok(envelope) => {
                        if let Err(e) = relay.handle_replicated(&envelope).await {
                            log::error!("Failed to apply replicated event from {addr}: {e}");
                        }
                    }
                    Err(e) => log::warn!("Bad replication envelope from {addr}: {e}"),
                },
                Ok(Message::Ping(data)) => ws_sender.send(Message::Pong(data)).await?,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::error!("Replication link error from {addr}: {e}");
                    break;
                }
            }
        }

        log::info!("Replication link from {addr} closed");
        Ok(())
    }
}

/// Percent-decoded value of `name` in a URL query string.
fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
}
