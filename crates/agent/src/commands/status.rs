//! `wgmesh status`

use crate::RendezvousClient;
use clap::Args;
use std::time::Duration;

#[derive(Args)]
pub struct StatusArgs {
    /// Rendezvous service URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub server: String,
}

pub async fn execute(args: StatusArgs) -> anyhow::Result<()> {
    let client = RendezvousClient::new(&args.server, Duration::from_secs(5))?;
    match client.health().await {
        Ok(health) if health.status == "ok" => {
            println!("✅ Rendezvous service is running at {}", args.server);
        }
        Ok(health) => {
            println!("⚠️  Rendezvous service at {} reports {}", args.server, health.status);
            std::process::exit(1);
        }
        Err(e) => {
            println!("❌ Rendezvous service is not responding at {}: {}", args.server, e);
            std::process::exit(1);
        }
    }
    Ok(())
}
