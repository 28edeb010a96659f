//! Error taxonomy shared by the relay components.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed input; rejected before any state change.
    #[error("Invalid fragment: {0}")]
    InvalidFragment(String),
    /// Push target is gone or no longer accepting frames.
    #[error("Stale connection: {0}")]
    StaleConnection(String),
    /// Backing store I/O failed; the caller decides whether to retry.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("Replication to {region} failed: {reason}")]
    ReplicationFailure { region: String, reason: String },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl RelayError {
    /// Whether the failure is transient and worth retrying by the transport layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::ReplicationFailure { .. })
    }
}
