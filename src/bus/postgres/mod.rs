//! PostgreSQL LISTEN/NOTIFY notification bus.
//!
//! Publishing runs `pg_notify` over the shared pool and needs no listener.
//! Receiving uses one dedicated connection owned by a background loop (see
//! `listener`), started at construction when listener options are known.
//!
//! `subscribe` registers the handler and cancels the loop's wake-up token
//! under the registry lock, so the loop LISTENs on a new topic before it
//! waits again. While the listener is connected, `subscribe` returns only
//! once the topic is LISTENed; while it is reconnecting, it returns at once
//! and the next session picks the topic up.

mod listener;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use self::listener::{run_listener, ListenStatus, ListenerState, SharedState, StatusSender};
use super::{Bus, BusError, Handler, Payload, Result, DEFAULT_LISTENER_RETRY_DELAY_MS};

pub(crate) const DRIVER: &str = "postgres";

/// Longest channel name the server keeps intact (NAMEDATALEN - 1).
const MAX_CHANNEL_LEN: usize = 63;

/// Reject channel names the server cannot LISTEN on as given.
///
/// Longer names would be silently truncated, so notifications would arrive
/// on a channel nobody subscribed to.
fn validate_channel(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(BusError::Subscribe("channel name is empty".to_string()));
    }
    if topic.contains('\0') {
        return Err(BusError::Subscribe(format!(
            "channel name {:?} contains a NUL byte",
            topic
        )));
    }
    if topic.len() > MAX_CHANNEL_LEN {
        return Err(BusError::Subscribe(format!(
            "channel name is {} bytes, limit is {}",
            topic.len(),
            MAX_CHANNEL_LEN
        )));
    }
    Ok(())
}

/// LISTEN/NOTIFY bus.
pub struct PostgresBus {
    pool: PgPool,
    listen_options: Option<PgConnectOptions>,
    state: SharedState,
    status: StatusSender,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl PostgresBus {
    /// Create a bus whose listener connects with the pool's own options.
    pub fn from_pool(pool: PgPool, retry_delay: Duration) -> Self {
        let options = (*pool.connect_options()).clone();
        Self::new(pool, Some(options), retry_delay)
    }

    /// Create a bus with explicit listener options.
    ///
    /// Without options the bus can still publish, but `subscribe` fails with
    /// `BusError::MissingConnectionString`. Must be called inside a tokio
    /// runtime when options are given: the listener is spawned immediately.
    pub fn new(
        pool: PgPool,
        listen_options: Option<PgConnectOptions>,
        retry_delay: Duration,
    ) -> Self {
        let state: SharedState = Arc::new(RwLock::new(ListenerState::new()));
        let (status, _) = watch::channel(ListenStatus::default());
        let status: StatusSender = Arc::new(status);

        let listener = listen_options.clone().map(|options| {
            tokio::spawn(run_listener(
                options,
                Arc::clone(&state),
                Arc::clone(&status),
                retry_delay,
            ))
        });

        Self {
            pool,
            listen_options,
            state,
            status,
            listener: StdMutex::new(listener),
        }
    }

    /// Default listener reconnect delay.
    pub fn default_retry_delay() -> Duration {
        Duration::from_millis(DEFAULT_LISTENER_RETRY_DELAY_MS)
    }

    fn stop_listener(&self) {
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
                info!(driver = DRIVER, "Notification listener stopped");
            }
        }
        self.status.send_modify(ListenStatus::disconnect);
    }
}

#[async_trait]
impl Bus for PostgresBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(driver = DRIVER, topic = %topic))]
    async fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
        // NOTIFY payloads are text.
        let payload = payload.into_text()?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        debug!("Notification sent");
        Ok(())
    }

    #[tracing::instrument(name = "bus.subscribe", skip_all, fields(driver = DRIVER, topic = %topic))]
    async fn subscribe(&self, topic: &str, handler: Box<dyn Handler>) -> Result<()> {
        if self.listen_options.is_none() {
            return Err(BusError::MissingConnectionString);
        }
        validate_channel(topic)?;

        let mut status = self.status.subscribe();
        let handler: Arc<dyn Handler> = handler.into();
        {
            let mut guard = self.state.write().await;
            guard.subscriptions.add(topic, handler);
            guard.wake.cancel();
        }

        // The sender lives as long as `self`, so this only ends once settled.
        let rejected = match status.wait_for(|s| s.settled(topic)).await {
            Ok(current) => current.rejected.contains(topic),
            Err(_) => false,
        };
        if rejected {
            return Err(BusError::Subscribe(format!(
                "server refused to LISTEN on {:?}",
                topic
            )));
        }

        debug!("Handler subscribed");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop_listener();
        Ok(())
    }

    fn driver(&self) -> &'static str {
        DRIVER
    }
}

impl Drop for PostgresBus {
    fn drop(&mut self) {
        self.stop_listener();
    }
}
