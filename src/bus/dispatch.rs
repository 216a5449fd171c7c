//! Handler registry and detached dispatch.
//!
//! Every backend keeps a `Subscriptions` map behind its own lock and hands
//! deliveries to `spawn_handlers`, which runs each handler on a fresh task.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::Handler;

/// Topic to handler mapping owned by one bus instance.
///
/// Append-only: handlers are never removed and duplicates are kept.
#[derive(Default)]
pub struct Subscriptions {
    topics: HashMap<String, Vec<Arc<dyn Handler>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler. Returns `true` if this is the first handler for the topic.
    pub fn add(&mut self, topic: &str, handler: Arc<dyn Handler>) -> bool {
        match self.topics.get_mut(topic) {
            Some(handlers) => {
                handlers.push(handler);
                false
            }
            None => {
                self.topics.insert(topic.to_string(), vec![handler]);
                true
            }
        }
    }

    /// Copy of the handlers currently registered for `topic`.
    pub fn snapshot(&self, topic: &str) -> Vec<Arc<dyn Handler>> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    /// Every topic with at least one handler.
    pub fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Number of handlers registered for `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Run each handler on its own detached task.
///
/// Handler errors and panics are logged with topic and driver, never
/// propagated. The returned handles are only useful to tests.
pub fn spawn_handlers(
    driver: &'static str,
    topic: &str,
    handlers: Vec<Arc<dyn Handler>>,
    payload: Bytes,
) -> Vec<JoinHandle<()>> {
    if handlers.is_empty() {
        debug!(driver, topic = %topic, "No handlers for topic");
        return Vec::new();
    }

    let topic: Arc<str> = Arc::from(topic);
    handlers
        .into_iter()
        .map(|handler| {
            let topic = Arc::clone(&topic);
            let payload = payload.clone();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(handler.handle(payload))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(driver, topic = %topic, error = %e, "Handler failed");
                    }
                    Err(_) => {
                        error!(driver, topic = %topic, "Handler panicked");
                    }
                }
            })
        })
        .collect()
}
