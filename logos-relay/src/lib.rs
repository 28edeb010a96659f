//! # logos-relay: Multi-region whiteboard relay
//!
//! Reassembles fragmented drawing updates, fans completed updates out to
//! every other participant of a session, and replicates them one hop to
//! peer regions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer (region)         │
//! │ (per user)  │     JSON frames     │                              │
//! └─────────────┘                     │  ReassemblyEngine            │
//!                                     │        │ exactly-once        │
//!                                     │        ▼                     │
//!                                     │  SnapshotService  ◄── getState
//!                                     │        │                     │
//!                                     │        ▼                     │
//!                                     │  BroadcastRouter ──► session │
//!                                     │        │                     │
//!                                     └────────┼─────────────────────┘
//!                                              ▼
//!                                  CrossRegionReplicator ──► peer regions
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Client frames, broadcast events, replication envelopes
//! - [`reassembly`]: Order-independent, exactly-once fragment reassembly
//! - [`router`]: Best-effort per-target fan-out
//! - [`replication`]: One-hop cross-region publish
//! - [`registry`]: Session membership with TTL expiry
//! - [`snapshot`]: Latest-wins session state for late joiners
//! - [`storage`]: Fragment and snapshot stores (in-memory, RocksDB)
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket relay client

pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod pusher;
pub mod reassembly;
pub mod registry;
pub mod relay;
pub mod replication;
pub mod router;
pub mod snapshot;
pub mod storage;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PeerRegion, RelayConfig, DEFAULT_SESSION};
pub use error::RelayError;
pub use protocol::{
    split_update, BroadcastEvent, ClientAction, ClientFrame, ClientPacket, DeliveredPacket,
    EventKind, Fragment, LogicalMessage, MessageKey, ProtocolError, ReplicationEnvelope,
};
pub use pusher::{ChannelPusher, Pusher};
pub use reassembly::{ReassemblyEngine, ReassemblyOutcome};
pub use registry::{Connection, ConnectionRegistry, InMemoryConnectionRegistry};
pub use relay::{spawn_bus_listener, Relay, RelayParts, RelayStats, SweepReport};
pub use replication::{
    CrossRegionReplicator, LinkStats, LocalBus, PeerLinkBus, ReplicationBus, ReplicationReport,
};
pub use router::{BroadcastRouter, RouteSummary};
pub use snapshot::SnapshotService;
pub use storage::{
    FragmentStore, InMemoryFragmentStore, InMemorySnapshotStore, RocksStore, SnapshotStore,
    StoreConfig, StoreError, StoredFragment,
};
pub use server::{RelayServer, ServerStats};
pub use client::{ConnectionState, RelayClient, RelayEvent};
