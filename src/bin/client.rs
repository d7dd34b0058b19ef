//! Upgrade Tunnel Client
//!
//! Local side of the tunnel that:
//! - Sends the configured upgrade payload, chunk by chunk
//! - Skips intermediary responses until the tunnel answers `101`
//! - Exposes a local listener whose connections ride the session
//! - Reconnects when the session drops

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use upgrade_tunnel::{
    bridge::TunnelClient,
    config::{generate_example_config, Config},
    shutdown::Shutdown,
};

/// Config file read when `--config` is not given; missing is fine
const DEFAULT_CONFIG: &str = "config.toml";

/// Upgrade Tunnel Client - local proxy into the tunnel
#[derive(Parser, Debug)]
#[command(name = "upgrade-client")]
#[command(about = "Upgrade Tunnel Client - local proxy into the tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local listen address (overrides config)
    #[arg(long)]
    local: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example configuration")?;
        print!("{}", example);
        return Ok(());
    }

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::load_or_default(DEFAULT_CONFIG),
    }
    .context("Failed to load configuration")?;

    // Initialize logging
    config.logging.init(args.log_level.as_deref());

    let mut client_config = config.client.unwrap_or_default();
    if let Some(server) = args.server {
        client_config.server = server;
    }
    if let Some(local) = args.local {
        client_config.local_listen = local;
    }

    let shutdown = Shutdown::new();
    let client = TunnelClient::from_config(&client_config, shutdown.clone())
        .context("Invalid client configuration")?;

    info!("Upgrade Tunnel Client v{}", upgrade_tunnel::VERSION);
    info!("Tunnel server: {}", client_config.server);

    shutdown.listen_for_signals();
    client.run().await.context("Tunnel client failed")?;
    Ok(())
}
