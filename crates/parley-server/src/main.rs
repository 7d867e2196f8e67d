//! # Parley Server
//!
//! Realtime chat server. Instances sharing a Redis URL form one cluster.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (single instance, in-memory)
//! parley
//!
//! # Run with a config file
//! PARLEY_CONFIG=/path/to/parley.toml parley
//!
//! # Override settings from the environment
//! PARLEY__PORT=8081 PARLEY__RELAY__REDIS_URL=redis://127.0.0.1:6379 parley
//!
//! # Print the effective configuration
//! parley --print-config
//! ```

mod api;
mod config;
mod handlers;
mod metrics;
mod redis_store;

use anyhow::Result;
use config::LogFormat;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::load()?;

    if std::env::args().any(|arg| arg == "--print-config") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
