//! Self-healing LISTEN loop.
//!
//! States: connecting, waiting, recovering. A session owns one dedicated
//! connection and the set of channels LISTENed on it; any connection error
//! ends the session and the outer retry opens a fresh one after a fixed delay,
//! re-LISTENing every registered topic.
//!
//! Progress is published on a `watch` channel so `subscribe` can wait until
//! its topic is actually LISTENed on the live connection.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use bytes::Bytes;
use sqlx::postgres::{PgConnectOptions, PgListener, PgNotification, PgPoolOptions};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DRIVER;
use crate::bus::dispatch::{spawn_handlers, Subscriptions};
use crate::bus::BusError;
use crate::utils::retry::listener_backoff;

/// Registry and wake-up token, guarded by one lock.
pub(crate) struct ListenerState {
    pub(crate) subscriptions: Subscriptions,
    /// Cancelled by `subscribe` to interrupt the current wait.
    pub(crate) wake: CancellationToken,
}

impl ListenerState {
    pub(crate) fn new() -> Self {
        Self {
            subscriptions: Subscriptions::new(),
            wake: CancellationToken::new(),
        }
    }
}

pub(crate) type SharedState = Arc<RwLock<ListenerState>>;

/// What the current session has LISTENed on.
///
/// Reset on every connect and cleared on disconnect.
#[derive(Debug, Default)]
pub(crate) struct ListenStatus {
    pub(crate) connected: bool,
    pub(crate) listening: HashSet<String>,
    /// Topics the server refused to LISTEN on during this session.
    pub(crate) rejected: HashSet<String>,
}

impl ListenStatus {
    /// Whether a `subscribe` on `topic` can stop waiting.
    pub(crate) fn settled(&self, topic: &str) -> bool {
        !self.connected || self.listening.contains(topic) || self.rejected.contains(topic)
    }

    pub(crate) fn disconnect(&mut self) {
        *self = Self::default();
    }

    fn connect(&mut self) {
        *self = Self {
            connected: true,
            ..Self::default()
        };
    }
}

pub(crate) type StatusSender = Arc<watch::Sender<ListenStatus>>;

/// Run sessions forever, reconnecting after `retry_delay` on every failure.
pub(crate) async fn run_listener(
    options: PgConnectOptions,
    state: SharedState,
    status: StatusSender,
    retry_delay: Duration,
) {
    info!(driver = DRIVER, "Notification listener started");

    let result = (|| run_session(options.clone(), Arc::clone(&state), Arc::clone(&status)))
        .retry(listener_backoff(retry_delay))
        .notify(|err: &BusError, dur: Duration| {
            warn!(driver = DRIVER, error = %err, delay = ?dur, "Listener connection failed, reconnecting");
        })
        .await;

    match result {
        Ok(never) => match never {},
        Err(e) => error!(driver = DRIVER, error = %e, "Notification listener stopped"),
    }
}

async fn connect(options: PgConnectOptions) -> Result<PgListener, BusError> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| BusError::Connection(e.to_string()))?;

    PgListener::connect_with(&pool)
        .await
        .map_err(|e| BusError::Connection(e.to_string()))
}

/// One connection's lifetime. Only returns on error.
async fn run_session(
    options: PgConnectOptions,
    state: SharedState,
    status: StatusSender,
) -> Result<Infallible, BusError> {
    let mut listener = connect(options).await?;
    status.send_modify(ListenStatus::connect);
    info!(driver = DRIVER, "Listener connected");

    let result = listen_loop(&mut listener, &state, &status).await;

    // Pending subscribers stop waiting; the next session re-LISTENs.
    status.send_modify(ListenStatus::disconnect);
    result
}

async fn listen_loop(
    listener: &mut PgListener,
    state: &SharedState,
    status: &StatusSender,
) -> Result<Infallible, BusError> {
    loop {
        // Fresh token and topic snapshot in one critical section: a subscribe
        // after this point cancels `wake` and the wait below returns at once.
        let (wake, topics) = {
            let mut guard = state.write().await;
            guard.wake = CancellationToken::new();
            (guard.wake.clone(), guard.subscriptions.topics())
        };

        for topic in topics {
            let attempted = {
                let current = status.borrow();
                current.listening.contains(&topic) || current.rejected.contains(&topic)
            };
            if attempted {
                continue;
            }
            match listener.listen(&topic).await {
                Ok(()) => {
                    debug!(driver = DRIVER, topic = %topic, "Listening");
                    status.send_modify(|s| {
                        s.listening.insert(topic);
                    });
                }
                // The server answered: the connection is fine, the channel is not.
                Err(e) if is_topic_error(&e) => {
                    error!(
                        driver = DRIVER,
                        topic = %topic,
                        error = %e,
                        "LISTEN rejected, skipping topic"
                    );
                    status.send_modify(|s| {
                        s.rejected.insert(topic);
                    });
                }
                Err(e) => {
                    return Err(BusError::Connection(format!("LISTEN {} failed: {}", topic, e)));
                }
            }
        }

        tokio::select! {
            _ = wake.cancelled() => {
                debug!(driver = DRIVER, "Listener woken to refresh topics");
            }
            received = listener.try_recv() => match received {
                Ok(Some(notification)) => dispatch(state, notification).await,
                Ok(None) => {
                    return Err(BusError::Connection("listener connection lost".to_string()));
                }
                Err(e) => return Err(BusError::Connection(e.to_string())),
            },
        }
    }
}

/// Errors reported by the server for one statement leave the connection usable.
pub(crate) fn is_topic_error(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(_))
}

async fn dispatch(state: &SharedState, notification: PgNotification) {
    let topic = notification.channel();
    let handlers = state.read().await.subscriptions.snapshot(topic);
    let payload = Bytes::copy_from_slice(notification.payload().as_bytes());

    spawn_handlers(DRIVER, topic, handlers, payload);
}
