//! Wire protocol for whiteboard fragments and broadcast events.
//!
//! Client frames are JSON text over WebSocket:
//! ```text
//! client ──► relay   {"packetID","packetNum","packetCount","contents"}   (fragment)
//!                    {"action":"getState"}                              (state request)
//! relay  ──► client  {"sender","packetNum","packetCount","packetID","contents"}
//! relay  ──► peer    {"source","detail-type","detail":{BroadcastEvent}}
//! ```
//!
//! `packetNum` 0 is the metadata fragment: its `packetCount` declares how
//! many data fragments (1..=N) make up the logical message.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Source tag stamped on every replication envelope.
pub const APP_SOURCE: &str = "WhiteboardApplication";

/// Detail-type discriminator for completed whiteboard updates.
pub const DETAIL_TYPE: &str = "WhiteboardMessageReceived";

/// Reassembled payload that wipes the whole session.
pub const CLEAR_COMMAND: &[u8] = b"clear";

/// Identity of one logical message: (session, sender, message id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub session_id: String,
    pub sender_id: String,
    pub message_id: String,
}

impl MessageKey {
    pub fn new(
        session_id: impl Into<String>,
        sender_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            message_id: message_id.into(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{}", self.session_id, self.sender_id, self.message_id)
    }
}

/// One piece of a logical message.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub key: MessageKey,
    /// 0 = metadata fragment, 1..=N = data fragments
    pub seq: u32,
    /// Expected number of data fragments (metadata fragment only)
    pub expected_count: Option<u32>,
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Metadata fragment declaring `expected_count` data fragments.
    pub fn metadata(key: MessageKey, expected_count: u32) -> Self {
        Self {
            key,
            seq: 0,
            expected_count: Some(expected_count),
            payload: Vec::new(),
        }
    }

    /// Data fragment `seq` (1-based).
    pub fn data(key: MessageKey, seq: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            seq,
            expected_count: None,
            payload: payload.into(),
        }
    }

    /// Build a fragment from a client packet received on `sender_id`'s connection.
    pub fn from_packet(
        session_id: &str,
        sender_id: &str,
        packet: ClientPacket,
    ) -> Result<Self, RelayError> {
        let seq = u32::try_from(packet.packet_num).map_err(|_| {
            RelayError::InvalidFragment(format!("packetNum out of range: {}", packet.packet_num))
        })?;
        let expected_count = if seq == 0 {
            Some(u32::try_from(packet.packet_count).map_err(|_| {
                RelayError::InvalidFragment(format!(
                    "packetCount out of range: {}",
                    packet.packet_count
                ))
            })?)
        } else {
            None
        };
        let fragment = Self {
            key: MessageKey::new(session_id, sender_id, packet.packet_id),
            seq,
            expected_count,
            payload: packet.contents.into_bytes(),
        };
        fragment.validate()?;
        Ok(fragment)
    }

    pub fn is_metadata(&self) -> bool {
        self.seq == 0
    }

    /// Reject fragments that can never be placed in a message.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.key.session_id.is_empty() {
            return Err(RelayError::InvalidFragment("empty session id".into()));
        }
        if self.key.sender_id.is_empty() {
            return Err(RelayError::InvalidFragment("empty sender id".into()));
        }
        if self.key.message_id.is_empty() {
            return Err(RelayError::InvalidFragment("empty message id".into()));
        }
        if self.is_metadata() && self.expected_count.is_none() {
            return Err(RelayError::InvalidFragment(format!(
                "metadata fragment for {} carries no expected count",
                self.key
            )));
        }
        Ok(())
    }
}

/// A fully reassembled logical message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalMessage {
    pub key: MessageKey,
    pub fragment_count: u32,
    pub payload: Vec<u8>,
}

impl LogicalMessage {
    /// Whether the payload is the session-wide clear command.
    pub fn is_clear(&self) -> bool {
        self.payload == CLEAR_COMMAND
    }

    /// Render as the single self-contained packet delivered to clients.
    pub fn to_delivered_packet(&self) -> DeliveredPacket {
        DeliveredPacket {
            sender: self.key.sender_id.clone(),
            packet_num: 1,
            packet_count: 1,
            packet_id: self.key.message_id.clone(),
            contents: String::from_utf8_lossy(&self.payload).into_owned(),
        }
    }
}

/// Kind of broadcast event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A normal drawing update completed
    Update,
    /// The session was wiped
    Clear,
}

/// Unit published to local fan-out and to peer regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub kind: EventKind,
    pub session_id: String,
    pub sender_connection_id: String,
    pub message_id: String,
    pub fragment_count: u32,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// True when the event arrived from a peer region
    pub replicated: bool,
    pub source_region: String,
}

impl BroadcastEvent {
    /// Locally-originated event for a completed message.
    pub fn completed(message: &LogicalMessage, region: impl Into<String>) -> Self {
        let kind = if message.is_clear() {
            EventKind::Clear
        } else {
            EventKind::Update
        };
        Self {
            kind,
            session_id: message.key.session_id.clone(),
            sender_connection_id: message.key.sender_id.clone(),
            message_id: message.key.message_id.clone(),
            fragment_count: message.fragment_count,
            payload: message.payload.clone(),
            replicated: false,
            source_region: region.into(),
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(
            self.session_id.clone(),
            self.sender_connection_id.clone(),
            self.message_id.clone(),
        )
    }

    /// The logical message carried by this event.
    pub fn to_message(&self) -> LogicalMessage {
        LogicalMessage {
            key: self.key(),
            fragment_count: self.fragment_count,
            payload: self.payload.clone(),
        }
    }

    /// JSON bytes pushed to each target connection.
    pub fn encode_for_client(&self) -> Result<Vec<u8>, ProtocolError> {
        self.to_message().to_delivered_packet().encode()
    }
}

/// Envelope carried by the replication bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEnvelope {
    pub source: String,
    #[serde(rename = "detail-type")]
    pub detail_type: String,
    pub detail: BroadcastEvent,
}

impl ReplicationEnvelope {
    /// Wrap an event for a peer region; the copy is always tagged replicated.
    pub fn wrap(event: &BroadcastEvent) -> Self {
        let mut detail = event.clone();
        detail.replicated = true;
        Self {
            source: APP_SOURCE.to_string(),
            detail_type: DETAIL_TYPE.to_string(),
            detail,
        }
    }

    /// Whether subscribers of a shared bus should handle this envelope.
    pub fn is_whiteboard_event(&self) -> bool {
        self.source == APP_SOURCE && self.detail_type == DETAIL_TYPE
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// One packet as sent by a drawing client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPacket {
    #[serde(rename = "packetID")]
    pub packet_id: String,
    #[serde(rename = "packetNum")]
    pub packet_num: i64,
    #[serde(rename = "packetCount", default)]
    pub packet_count: i64,
    #[serde(default)]
    pub contents: String,
}

/// Named client actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientAction {
    #[serde(rename = "getState")]
    GetState,
}

/// Any inbound client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Action { action: ClientAction },
    Packet(ClientPacket),
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Packet delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredPacket {
    pub sender: String,
    #[serde(rename = "packetNum")]
    pub packet_num: u32,
    #[serde(rename = "packetCount")]
    pub packet_count: u32,
    #[serde(rename = "packetID")]
    pub packet_id: String,
    pub contents: String,
}

impl DeliveredPacket {
    pub fn is_clear(&self) -> bool {
        self.contents.as_bytes() == CLEAR_COMMAND
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Split an update into a metadata packet followed by data packets.
///
/// Each data packet carries at most `max_fragment_size` bytes, cut on UTF-8
/// character boundaries. A character wider than the limit travels alone.
pub fn split_update(packet_id: &str, contents: &str, max_fragment_size: usize) -> Vec<ClientPacket> {
    let max = max_fragment_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < contents.len() {
        let mut end = (start + max).min(contents.len());
        while !contents.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + 1;
            while !contents.is_char_boundary(end) {
                end += 1;
            }
        }
        chunks.push(&contents[start..end]);
        start = end;
    }

    let count = chunks.len() as i64;
    let mut packets = Vec::with_capacity(chunks.len() + 1);
    packets.push(ClientPacket {
        packet_id: packet_id.to_string(),
        packet_num: 0,
        packet_count: count,
        contents: String::new(),
    });
    for (i, chunk) in chunks.into_iter().enumerate() {
        packets.push(ClientPacket {
            packet_id: packet_id.to_string(),
            packet_num: i as i64 + 1,
            packet_count: count,
            contents: chunk.to_string(),
        });
    }
    packets
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Byte payloads travel as base64 strings inside JSON envelopes.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
