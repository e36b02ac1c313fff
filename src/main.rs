use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod dispatch;
mod error;
mod observability;
mod pipeline;
mod policy;
mod proxy;
mod trace;

use config::Config;
use pipeline::Gateway;

#[derive(Parser)]
#[command(name = "edge-gateway")]
#[command(about = "Edge gateway with per-route dispatch, rate limiting, and resilient proxying")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A missing config file is not an error: environment-only deployments
    // carry everything through variables.
    let config = if tokio::fs::try_exists(&args.config).await.unwrap_or(false) {
        info!("Loading configuration from {}", args.config);
        Config::load(&args.config).await?
    } else {
        info!("No config file at {}, using environment", args.config);
        Config::from_env()?
    };

    if args.validate_config {
        println!("Configuration is valid");
        return Ok(());
    }

    let gateway = Arc::new(Gateway::new(config)?);

    tokio::select! {
        result = gateway.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
