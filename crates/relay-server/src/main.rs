//! # Relay Server
//!
//! In-memory publish/subscribe message broker.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Run with custom config
//! relay --config /path/to/relay.toml
//!
//! # Show the effective configuration
//! relay --print-config
//!
//! # Run with environment variables
//! RELAY_PORT=7878 RELAY_HOST=0.0.0.0 RELAY_LIMITS__MAX_CONNECTIONS=500 relay
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// In-memory publish/subscribe message broker.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_server=info,relay_core=info,relay_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => {
            config::Config::from_file(shellexpand::tilde(&path.to_string_lossy()).into_owned())?
        }
        None => config::Config::load()?,
    };

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting Relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
    }

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
