//! Relay configuration.

use std::path::PathBuf;
use std::str::FromStr;

use crate::registry::DEFAULT_CONNECTION_TTL_SECS;

/// Session used when a client connects without naming one.
pub const DEFAULT_SESSION: &str = "DEFAULT";

/// A peer region and the base WebSocket URL of its relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRegion {
    pub region: String,
    pub url: String,
}

impl FromStr for PeerRegion {
    type Err = String;

    /// Parses `REGION=URL`, e.g. `us-east-1=ws://10.0.1.5:9090`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (region, url) = s
            .split_once('=')
            .ok_or_else(|| format!("expected REGION=URL, got '{s}'"))?;
        let region = region.trim();
        let url = url.trim();
        if region.is_empty() || url.is_empty() {
            return Err(format!("expected REGION=URL, got '{s}'"));
        }
        Ok(Self {
            region: region.to_string(),
            url: url.to_string(),
        })
    }
}

/// Relay configuration for one region.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Region this relay serves
    pub region: String,
    /// Session for clients that do not name one
    pub default_session: String,
    /// Connection lifetime without an explicit disconnect
    pub connection_ttl_secs: u64,
    /// Lifetime of unfinished fragments and completion markers
    pub fragment_ttl_secs: u64,
    /// How often expired registry and fragment entries are purged
    pub sweep_interval_secs: u64,
    /// Frames that may queue per connection before pushes fail
    pub outbound_capacity: usize,
    /// Data bytes per fragment when splitting updates
    pub max_fragment_size: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Regions to replicate locally-originated events to
    pub peers: Vec<PeerRegion>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            region: "eu-west-2".to_string(),
            default_session: DEFAULT_SESSION.to_string(),
            connection_ttl_secs: DEFAULT_CONNECTION_TTL_SECS,
            fragment_ttl_secs: 3600,
            sweep_interval_secs: 60,
            outbound_capacity: 256,
            max_fragment_size: 16 * 1024,
            storage_path: None,
            peers: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Ephemeral port, in-memory stores, fast sweeps.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            sweep_interval_secs: 1,
            outbound_capacity: 64,
            max_fragment_size: 8,
            ..Self::default()
        }
    }
}
