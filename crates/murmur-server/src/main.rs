//! # Murmur Server
//!
//! Room-based group chat over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! murmur
//!
//! # Bind elsewhere
//! MURMUR_HOST=0.0.0.0 MURMUR_PORT=9000 murmur
//!
//! # Override any config key
//! MURMUR__LIMITS__MAX_CONNECTIONS=500 murmur
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "murmur=debug,murmur_core=debug";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Murmur server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
