//! wgmesh rendezvous daemon
//!
//! Serves the control API nodes register with.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgmesh_common::{InterfaceConfig, TunnelInterface};
use wgmesh_daemon::{PeerRegistry, RendezvousService, ServiceConfig};

#[derive(Parser)]
#[command(name = "wgmeshd")]
#[command(about = "wgmesh rendezvous daemon - peer registry and counterpart dissemination")]
#[command(version)]
struct Cli {
    /// Configuration file path (JSON, or TOML by extension)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Shared registration token, overrides the configuration file
    #[arg(long, env = "WGMESH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Control API port, overrides the configuration file
    #[arg(short = 'p', long)]
    control_port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("wgmesh daemon v{}", wgmesh_common::VERSION);

    let mut config = ServiceConfig::load(&cli.config)?;
    config.apply_overrides(cli.token, cli.control_port);
    config.validate()?;

    let tunnel = match &config.tunnel {
        Some(tunnel_config) => {
            let tunnel = TunnelInterface::new(
                InterfaceConfig {
                    name: tunnel_config.name.clone(),
                    address: Some(tunnel_config.address.clone()),
                    listen_port: config.listen_port,
                    private_key: config.private_key,
                },
                tunnel_config.driver.build(),
            )?;
            tunnel.create().await?;
            info!("Service tunnel {} up, public key {}", tunnel.name(), tunnel.public_key());
            Some(tunnel)
        }
        None => None,
    };

    let registry = Arc::new(PeerRegistry::new(config.peer_ttl()));
    let listener =
        tokio::net::TcpListener::bind((config.bind_addr.as_str(), config.control_port)).await?;
    let service = RendezvousService::new(config, registry, tunnel)?;

    service
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Daemon shutdown complete");
    Ok(())
}
