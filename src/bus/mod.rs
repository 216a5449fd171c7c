//! Notification bus.
//!
//! This module contains:
//! - `Bus` trait: publish/subscribe contract shared by every backend
//! - `Handler` trait: callback invoked for each delivered payload
//! - Bus configuration types and the backend factory
//! - Implementations: in-process, NATS, Redis pub/sub, PostgreSQL LISTEN/NOTIFY

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::info;

// Implementation modules
pub mod dispatch;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod payload;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

// Re-exports
pub use dispatch::Subscriptions;
pub use memory::MemoryBus;
#[cfg(feature = "nats")]
pub use nats::NatsBus;
pub use payload::Payload;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBus;
#[cfg(feature = "redis")]
pub use redis::RedisBus;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No connection string configured for the notification listener")]
    MissingConnectionString,

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

/// Handler for payloads delivered on a topic.
///
/// Invoked on a detached task, never on the publisher's task. Errors are
/// logged at the dispatch site and never reach the publisher.
pub trait Handler: Send + Sync {
    /// Process one delivered payload.
    fn handle(&self, payload: Bytes) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, payload: Bytes) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(payload))
    }
}

/// Publish/subscribe contract implemented by every backend.
///
/// Implementations:
/// - `MemoryBus`: in-process fan-out
/// - `NatsBus`: broker pass-through
/// - `RedisBus`: one shared pub/sub connection for all topics
/// - `PostgresBus`: LISTEN/NOTIFY with a self-healing listener
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to every handler subscribed to `topic`.
    ///
    /// Fails only for local problems (encoding, transport rejection).
    /// Handler outcomes are never reported here.
    async fn publish(&self, topic: &str, payload: Payload) -> Result<()>;

    /// Register a handler for future publishes on `topic`.
    ///
    /// Repeated calls with the same topic add independent handlers.
    async fn subscribe(&self, topic: &str, handler: Box<dyn Handler>) -> Result<()>;

    /// Release background tasks and connections held by the backend.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Driver name used in log events.
    fn driver(&self) -> &'static str;
}

/// Convenience methods layered over [`Bus`].
#[async_trait]
pub trait BusExt: Bus {
    /// Serialize `value` to JSON and publish it.
    async fn publish_json<T>(&self, topic: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = Payload::json(value)?;
        self.publish(topic, payload).await
    }
}

impl<B: Bus + ?Sized> BusExt for B {}

// ============================================================================
// Configuration
// ============================================================================

/// Default NATS address used when no broker URL is configured.
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

/// Default delay between listener reconnect attempts.
pub const DEFAULT_LISTENER_RETRY_DELAY_MS: u64 = 5_000;

/// Backend driver discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusDriver {
    /// In-process fan-out.
    Memory,
    /// NATS broker.
    Nats,
    /// Redis pub/sub over one multiplexed connection.
    Redis,
    /// PostgreSQL LISTEN/NOTIFY.
    Postgres,
}

impl BusDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusDriver::Memory => "memory",
            BusDriver::Nats => "nats",
            BusDriver::Redis => "redis",
            BusDriver::Postgres => "postgres",
        }
    }
}

/// Notification bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Backend selection. Unset falls back to the in-process bus.
    pub driver: Option<BusDriver>,
    /// Broker URL, only used by the NATS driver.
    pub url: String,
    /// Fixed delay between PostgreSQL listener reconnect attempts.
    pub listener_retry_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            driver: None,
            url: String::new(),
            listener_retry_delay_ms: DEFAULT_LISTENER_RETRY_DELAY_MS,
        }
    }
}

impl BusConfig {
    /// Broker URL with the local default applied.
    pub fn broker_url(&self) -> &str {
        if self.url.is_empty() {
            DEFAULT_NATS_URL
        } else {
            &self.url
        }
    }
}

/// Client handles built by the process bootstrap.
///
/// The Redis and PostgreSQL drivers require their handle. The listener
/// connection string for PostgreSQL is taken from the pool.
#[derive(Clone, Default)]
pub struct BusClients {
    #[cfg(feature = "redis")]
    pub redis: Option<::redis::Client>,
    #[cfg(feature = "postgres")]
    pub postgres: Option<sqlx::PgPool>,
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the notification bus based on configuration.
///
/// An unset driver degrades to the in-process bus. An explicit driver whose
/// handle (or cargo feature) is missing fails with `BusError::Config`.
#[cfg_attr(
    not(any(feature = "redis", feature = "postgres")),
    allow(unused_variables)
)]
pub async fn init_bus(config: &BusConfig, clients: BusClients) -> Result<Arc<dyn Bus>> {
    let bus: Arc<dyn Bus> = match config.driver {
        None | Some(BusDriver::Memory) => Arc::new(MemoryBus::new()),
        Some(BusDriver::Nats) => {
            #[cfg(feature = "nats")]
            {
                Arc::new(NatsBus::connect(config.broker_url()).await?)
            }

            #[cfg(not(feature = "nats"))]
            {
                return Err(feature_disabled(BusDriver::Nats));
            }
        }
        Some(BusDriver::Redis) => {
            #[cfg(feature = "redis")]
            {
                let client = clients.redis.ok_or_else(|| {
                    BusError::Config("redis driver selected but no redis client was provided".into())
                })?;
                Arc::new(RedisBus::new(client))
            }

            #[cfg(not(feature = "redis"))]
            {
                return Err(feature_disabled(BusDriver::Redis));
            }
        }
        Some(BusDriver::Postgres) => {
            #[cfg(feature = "postgres")]
            {
                let pool = clients.postgres.ok_or_else(|| {
                    BusError::Config(
                        "postgres driver selected but no database pool was provided".into(),
                    )
                })?;
                let delay = std::time::Duration::from_millis(config.listener_retry_delay_ms);
                Arc::new(PostgresBus::from_pool(pool, delay))
            }

            #[cfg(not(feature = "postgres"))]
            {
                return Err(feature_disabled(BusDriver::Postgres));
            }
        }
    };

    info!(driver = bus.driver(), "Notification bus initialized");
    Ok(bus)
}

#[allow(dead_code)]
fn feature_disabled(driver: BusDriver) -> BusError {
    BusError::Config(format!(
        "{} driver requires the '{}' feature. Rebuild with --features {}",
        driver.as_str(),
        driver.as_str(),
        driver.as_str()
    ))
}

#[cfg(test)]
mod tests;
