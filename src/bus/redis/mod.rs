//! Redis pub/sub notification bus.
//!
//! One pub/sub connection serves every topic. It is opened on the first
//! `subscribe`, split into a command sink and a message stream, and a single
//! dispatch task drains the stream for the lifetime of the bus.
//!
//! Subscriptions are cumulative: each new topic adds one SUBSCRIBE on the
//! shared sink. A channel counts as subscribed only once Redis confirmed it,
//! so a failed SUBSCRIBE is retried by the next `subscribe` on that topic.
//! There is no reconnect: once the stream ends the bus stops delivering and
//! must be rebuilt.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::dispatch::{spawn_handlers, Subscriptions};
use super::{Bus, BusError, Handler, Payload, Result};

const DRIVER: &str = "redis";

/// Command half of the shared connection and the channels it is subscribed to.
struct SharedSink {
    sink: PubSubSink,
    channels: HashSet<String>,
}

/// Redis bus sharing one subscription connection across all topics.
pub struct RedisBus {
    client: Client,
    subscriptions: Arc<RwLock<Subscriptions>>,
    sink: OnceCell<Mutex<SharedSink>>,
    publisher: OnceCell<MultiplexedConnection>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl RedisBus {
    /// Create a bus over an already configured client. No connection is
    /// opened until the first publish or subscribe.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            subscriptions: Arc::new(RwLock::new(Subscriptions::new())),
            sink: OnceCell::new(),
            publisher: OnceCell::new(),
            dispatcher: StdMutex::new(None),
        }
    }

    /// Shared subscription sink, opening the connection on first use.
    ///
    /// Concurrent first callers race on the cell; exactly one connection and
    /// one dispatch task are created.
    async fn sink(&self) -> Result<&Mutex<SharedSink>> {
        self.sink
            .get_or_try_init(|| async {
                let pubsub = self
                    .client
                    .get_async_pubsub()
                    .await
                    .map_err(|e| BusError::Connection(e.to_string()))?;
                let (sink, stream) = pubsub.split();

                let handle = tokio::spawn(run_dispatch(stream, Arc::clone(&self.subscriptions)));
                if let Ok(mut slot) = self.dispatcher.lock() {
                    *slot = Some(handle);
                }

                info!(driver = DRIVER, "Shared subscription connection established");
                Ok(Mutex::new(SharedSink {
                    sink,
                    channels: HashSet::new(),
                }))
            })
            .await
    }

    async fn publisher(&self) -> Result<MultiplexedConnection> {
        let conn = self
            .publisher
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| BusError::Connection(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }

    fn stop_dispatcher(&self) {
        if let Ok(mut slot) = self.dispatcher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Drain the shared message stream until the connection goes away.
async fn run_dispatch(mut stream: PubSubStream, subscriptions: Arc<RwLock<Subscriptions>>) {
    while let Some(msg) = stream.next().await {
        let topic = msg.get_channel_name().to_string();
        let payload = Bytes::copy_from_slice(msg.get_payload_bytes());

        let handlers = subscriptions.read().await.snapshot(&topic);
        spawn_handlers(DRIVER, &topic, handlers, payload);
    }

    error!(
        driver = DRIVER,
        "Subscription stream closed; no further messages will be delivered"
    );
}

#[async_trait]
impl Bus for RedisBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(driver = DRIVER, topic = %topic))]
    async fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
        let payload = payload.into_bytes()?;
        let mut conn = self.publisher().await?;

        let receivers: i64 = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        debug!(receivers, "Published to redis");
        Ok(())
    }

    #[tracing::instrument(name = "bus.subscribe", skip_all, fields(driver = DRIVER, topic = %topic))]
    async fn subscribe(&self, topic: &str, handler: Box<dyn Handler>) -> Result<()> {
        // Held until the handler is registered: concurrent callers on the same
        // topic wait for the first SUBSCRIBE to be confirmed.
        let mut shared = self.sink().await?.lock().await;

        if shared.channels.contains(topic) {
            debug!("Handler added to existing redis channel");
        } else {
            shared
                .sink
                .subscribe(topic)
                .await
                .map_err(|e| BusError::Subscribe(e.to_string()))?;
            shared.channels.insert(topic.to_string());
            info!("Subscribed to redis channel");
        }

        let handler: Arc<dyn Handler> = handler.into();
        self.subscriptions.write().await.add(topic, handler);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop_dispatcher();
        Ok(())
    }

    fn driver(&self) -> &'static str {
        DRIVER
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.stop_dispatcher();
    }
}
