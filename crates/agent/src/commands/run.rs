//! `wgmesh run`

use crate::{ClientConfig, MeshClient};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct RunArgs {
    /// Configuration file path (JSON, or TOML by extension)
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Shared registration token, overrides the configuration file
    #[arg(long, env = "WGMESH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let mut config = ClientConfig::load(&args.config)?;
    config.apply_overrides(args.token);
    config.validate()?;

    let driver = config.driver.build();
    info!(
        "Starting node {} on {} ({:?} driver)",
        config.peer_id, config.interface_name, config.driver
    );

    let client = MeshClient::new(config, driver)?;
    info!("Public key {}", client.public_key());

    client
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
