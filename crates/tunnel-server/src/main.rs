//! tunnel-server binary

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunnel_server::{Cli, ServerConfig, TunnelServer};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli).context("Failed to load configuration")?;

    // RUST_LOG wins over the configured levels
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(name = %config.name, version = env!("CARGO_PKG_VERSION"), "Starting tunnel server");

    let server = TunnelServer::new(config)?;

    if let Err(e) = server.run().await {
        error!("Server error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
