//! In-process notification bus.
//!
//! Fans payloads out to handlers registered on this instance. Nothing leaves
//! the process and nothing is retained: a publish with no handlers is lost.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::dispatch::{spawn_handlers, Subscriptions};
use super::{Bus, Handler, Payload, Result};

const DRIVER: &str = "memory";

/// In-memory bus backed by a per-instance handler registry.
#[derive(Default)]
pub struct MemoryBus {
    subscriptions: RwLock<Subscriptions>,
}

impl MemoryBus {
    /// Create a new in-process bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handlers registered for a topic.
    pub async fn handler_count(&self, topic: &str) -> usize {
        self.subscriptions.read().await.handler_count(topic)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(driver = DRIVER, topic = %topic))]
    async fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
        let payload = payload.into_bytes()?;

        // Snapshot under the read lock, release before spawning.
        let handlers = self.subscriptions.read().await.snapshot(topic);

        debug!(handlers = handlers.len(), "Publishing in-process");
        spawn_handlers(DRIVER, topic, handlers, payload);
        Ok(())
    }

    #[tracing::instrument(name = "bus.subscribe", skip_all, fields(driver = DRIVER, topic = %topic))]
    async fn subscribe(&self, topic: &str, handler: Box<dyn Handler>) -> Result<()> {
        let handler: Arc<dyn Handler> = handler.into();
        self.subscriptions.write().await.add(topic, handler);

        debug!("Handler subscribed");
        Ok(())
    }

    fn driver(&self) -> &'static str {
        DRIVER
    }
}
