//! wgmesh node agent - Main Entry Point

use clap::{Parser, Subcommand};
use wgmesh_agent::commands::{keys, run, status};

/// wgmesh - WireGuard mesh node agent
#[derive(Parser)]
#[command(name = "wgmesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the mesh and keep the tunnel reconciled
    Run(run::RunArgs),

    /// Generate a private key
    Genkey,

    /// Derive a public key from a private key read on stdin
    Pubkey,

    /// Check the rendezvous service
    Status(status::StatusArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => run::execute(args).await?,
        Commands::Genkey => keys::genkey(&mut std::io::stdout())?,
        Commands::Pubkey => keys::pubkey(&mut std::io::stdin().lock(), &mut std::io::stdout())?,
        Commands::Status(args) => status::execute(args).await?,
    }

    Ok(())
}
