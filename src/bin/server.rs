//! Upgrade Tunnel Server
//!
//! Public endpoint of the tunnel that:
//! - Answers the `GET /users` status probe
//! - Authenticates WebSocket-shaped upgrade requests
//! - Bounds concurrent sessions
//! - Bridges every multiplexed stream to the local SOCKS service

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use upgrade_tunnel::{
    bridge::TunnelServer,
    config::{generate_example_config, Config},
    shutdown::Shutdown,
    transport,
};

/// Config file read when `--config` is not given; missing is fine
const DEFAULT_CONFIG: &str = "config.toml";

/// Upgrade Tunnel Server - multiplexed tunnel behind a WebSocket upgrade
#[derive(Parser, Debug)]
#[command(name = "upgrade-server")]
#[command(about = "Upgrade Tunnel Server - multiplexed tunnel behind a WebSocket upgrade")]
#[command(version)]
struct Args {
    /// Maximum concurrent sessions (overrides config)
    #[arg(env = "TUNNEL_MAX_CONNECTIONS", value_parser = clap::value_parser!(u64).range(1..))]
    max_connections: Option<u64>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

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

    let mut server_config = config.server.unwrap_or_default();
    if let Some(max) = args.max_connections {
        server_config.max_connections = usize::try_from(max).context("max_connections out of range")?;
    }
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }

    let shutdown = Shutdown::new();
    let server = TunnelServer::from_config(&server_config, shutdown.clone())
        .context("Invalid server configuration")?;

    info!("Upgrade Tunnel Server v{}", upgrade_tunnel::VERSION);
    let listener = transport::bind(&server_config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", server_config.listen))?;
    info!("Listening on {}", server_config.listen);
    info!("Forwarding streams to {}", server_config.socks_target);
    info!("Max sessions: {}", server_config.max_connections);

    shutdown.listen_for_signals();
    Arc::new(server).run(listener).await?;

    shutdown.drain(server_config.shutdown_grace()).await;
    info!("Server stopped");
    Ok(())
}
