//! Sovereign Relay — standalone entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use sovereign_relay::config::RelayConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sovereign-relay")]
#[command(version)]
#[command(about = "Relay between the record store and the OpenCode engine")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay service
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value = "8090")]
        port: u16,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sovereign_relay={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env();

    match cli.command {
        Commands::Serve { host, port } => {
            sovereign_relay::bootstrap::run_server(config, &host, port).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
