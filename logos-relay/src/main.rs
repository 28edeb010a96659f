use std::path::PathBuf;

use clap::Parser;
use log::info;

use logos_relay::{PeerRegion, RelayConfig, RelayServer};

#[derive(Debug, Parser)]
#[command(name = "logos-relay", about = "Multi-region whiteboard relay")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Region this relay serves
    #[arg(long, default_value = "eu-west-2")]
    region: String,

    /// RocksDB directory; in-memory stores when omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Peer region to replicate to, as REGION=URL (repeatable)
    #[arg(long = "peer")]
    peers: Vec<PeerRegion>,

    /// Session for clients that connect without one
    #[arg(long, default_value = logos_relay::DEFAULT_SESSION)]
    default_session: String,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind,
            region: self.region,
            default_session: self.default_session,
            storage_path: self.data_dir,
            peers: self.peers,
            ..RelayConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    info!(
        "Starting relay for {} with {} peer regions",
        config.region,
        config.peers.len()
    );

    let server = RelayServer::new(config)?;
    server.run().await
}
