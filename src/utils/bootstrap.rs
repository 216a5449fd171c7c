//! Bootstrap utilities for binaries embedding the bus.
//!
//! Shared initialization: tracing setup and bus construction from config.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{init_bus, Bus, BusClients};
use crate::config::{Config, LOG_ENV_VAR};

/// Initialize tracing with NOTIBUS_LOG environment variable.
///
/// Defaults to "info" level if NOTIBUS_LOG is not set. Safe to call more
/// than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Load configuration and build the bus from the supplied client handles.
pub async fn bootstrap_bus(
    config_path: Option<&str>,
    clients: BusClients,
) -> Result<(Config, Arc<dyn Bus>), Box<dyn std::error::Error>> {
    let config = Config::load(config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let driver = config.bus.driver.map(|d| d.as_str()).unwrap_or("unset");
    info!(driver, "Starting notification bus");

    let bus = init_bus(&config.bus, clients).await?;
    Ok((config, bus))
}
