//! # Ferrobus Server
//!
//! Message bus daemon: clients authenticate, get a unique name, own
//! well-known names, and exchange method calls, replies and signals.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! ferrobusd
//!
//! # Run with custom config
//! ferrobusd --config /path/to/ferrobus.toml
//!
//! # Override the listen address
//! ferrobusd --listen unix:path=/run/ferrobus.sock
//!
//! # Run with environment variables
//! FERROBUS_LISTEN=tcp:host=0.0.0.0,port=7000 FERROBUS_AUTH__TIMEOUT_MS=5000 ferrobusd
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "ferrobusd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address, e.g. tcp:host=127.0.0.1,port=7000
    #[arg(short, long, value_name = "ADDRESS")]
    listen: Option<String>,

    /// Answer calls to unknown names with an error instead of dropping them
    #[arg(long)]
    reply_on_unknown_destination: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferrobus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if args.reply_on_unknown_destination {
        config.routing.reply_on_unknown_destination = true;
    }

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting Ferrobus on {}", config.listen);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
