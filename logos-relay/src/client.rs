//! WebSocket client for a whiteboard relay.
//!
//! Provides:
//! - Connection lifecycle (connect into a session, disconnect)
//! - Update send with automatic fragmentation
//! - State requests for late joiners
//! - Received packets surfaced as [`RelayEvent`]s

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{split_update, ClientAction, ClientFrame, ClientPacket, DeliveredPacket, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the relay client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A complete update from another participant (or a snapshot entry)
    Update(DeliveredPacket),
    /// Someone cleared the whiteboard
    Cleared { sender: String },
}

/// The relay client.
pub struct RelayClient {
    session_id: String,
    server_url: String,
    max_fragment_size: usize,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<RelayEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<RelayEvent>,
}

impl RelayClient {
    /// `server_url` is the relay's base WebSocket URL, e.g. `ws://127.0.0.1:9090`.
    pub fn new(
        server_url: impl Into<String>,
        session_id: impl Into<String>,
        max_fragment_size: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            session_id: session_id.into(),
            server_url: server_url.into(),
            max_fragment_size,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay and join the session.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!(
            "{}/?session={}",
            self.server_url.trim_end_matches('/'),
            urlencoding::encode(&self.session_id)
        );
        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(RelayEvent::Connected).await;

        // Reader task: surface delivered packets
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_string(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                match DeliveredPacket::decode(text.as_bytes()) {
                    Ok(packet) => {
                        let event = if packet.is_clear() {
                            RelayEvent::Cleared {
                                sender: packet.sender,
                            }
                        } else {
                            RelayEvent::Update(packet)
                        };
                        let _ = event_tx.send(event).await;
                    }
                    Err(e) => log::warn!("Undecodable packet from relay: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Split `contents` into fragments and send them. Returns the packet id.
    pub async fn send_update(&self, contents: &str) -> Result<String, ProtocolError> {
        let packet_id = Uuid::new_v4().to_string();
        for packet in split_update(&packet_id, contents, self.max_fragment_size) {
            self.send_packet(packet).await?;
        }
        Ok(packet_id)
    }

    /// Wipe the whiteboard for everyone in the session.
    pub async fn send_clear(&self) -> Result<String, ProtocolError> {
        self.send_update("clear").await
    }

    /// Send one raw packet.
    pub async fn send_packet(&self, packet: ClientPacket) -> Result<(), ProtocolError> {
        self.send_frame(&ClientFrame::Packet(packet)).await
    }

    /// Ask the relay for the session's current state.
    pub async fn request_state(&self) -> Result<(), ProtocolError> {
        self.send_frame(&ClientFrame::Action {
            action: ClientAction::GetState,
        })
        .await
    }

    /// Close the connection; the writer sends a close frame once drained.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = frame.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
