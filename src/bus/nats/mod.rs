//! NATS notification bus.
//!
//! Thin pass-through: the broker does the fan-out, so there is no local
//! registry. Each `subscribe` opens its own broker subscription and a task
//! that hands every message to the handler on a detached task.
//!
//! Reconnection is left to the `async-nats` client. `close` drops the client,
//! after which every operation fails with `BusError::Connection`.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::dispatch::spawn_handlers;
use super::{Bus, BusError, Handler, Payload, Result};

const DRIVER: &str = "nats";

/// Broker-backed bus.
pub struct NatsBus {
    client: StdMutex<Option<async_nats::Client>>,
    subscriptions: StdMutex<Vec<JoinHandle<()>>>,
}

impl NatsBus {
    /// Connect to the broker at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connection(format!("{}: {}", url, e)))?;

        info!(driver = DRIVER, url = %url, "Connected to NATS");
        Ok(Self::new(client))
    }

    /// Wrap an existing client.
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client: StdMutex::new(Some(client)),
            subscriptions: StdMutex::new(Vec::new()),
        }
    }

    /// Number of live broker subscriptions held by this bus.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .map(|subs| subs.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Handle to the live client; clones share one connection.
    fn client(&self) -> Result<async_nats::Client> {
        self.client
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| BusError::Connection("NATS bus is closed".to_string()))
    }
}

#[async_trait]
impl Bus for NatsBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(driver = DRIVER, topic = %topic))]
    async fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
        let payload = payload.into_bytes()?;

        self.client()?
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        debug!("Published to NATS");
        Ok(())
    }

    #[tracing::instrument(name = "bus.subscribe", skip_all, fields(driver = DRIVER, topic = %topic))]
    async fn subscribe(&self, topic: &str, handler: Box<dyn Handler>) -> Result<()> {
        let mut subscriber = self
            .client()?
            .subscribe(topic.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let handler: Arc<dyn Handler> = handler.into();
        let topic_name = topic.to_string();
        let task = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                spawn_handlers(DRIVER, &topic_name, vec![Arc::clone(&handler)], message.payload);
            }
            debug!(driver = DRIVER, topic = %topic_name, "NATS subscription ended");
        });

        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(task);
        }

        info!("Subscribed to NATS subject");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let tasks = match self.subscriptions.lock() {
            Ok(mut subs) => std::mem::take(&mut *subs),
            Err(_) => Vec::new(),
        };
        // Dropping a subscriber unsubscribes it.
        for task in tasks {
            task.abort();
        }

        let client = match self.client.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(client) = client else {
            return Ok(());
        };

        // The connection shuts down once the last client clone is dropped.
        client
            .flush()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        drop(client);

        info!(driver = DRIVER, "NATS bus closed");
        Ok(())
    }

    fn driver(&self) -> &'static str {
        DRIVER
    }
}
