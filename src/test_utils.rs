//! Test utilities and handler doubles.
//!
//! Handlers here report deliveries over channels so tests can await them
//! with a timeout instead of sleeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::bus::{BusError, Handler, Result};

/// Default time tests wait for a delivery.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler that forwards every payload to a channel.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl RecordingHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Handler sharing an existing channel, for several subscriptions feeding one receiver.
    pub fn with_sender(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }
}

impl Handler for RecordingHandler {
    fn handle(&self, payload: Bytes) -> BoxFuture<'static, Result<()>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            tx.send(payload)
                .map_err(|e| BusError::Handler(format!("receiver dropped: {}", e)))
        })
    }
}

/// Handler that counts invocations.
#[derive(Default)]
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter, readable after the handler is boxed.
    pub fn count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.count)
    }
}

impl Handler for CountingHandler {
    fn handle(&self, _payload: Bytes) -> BoxFuture<'static, Result<()>> {
        let count = Arc::clone(&self.count);
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Handler that always fails.
pub struct FailingHandler;

impl Handler for FailingHandler {
    fn handle(&self, _payload: Bytes) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Err(BusError::Handler("intentional failure".to_string())) })
    }
}

/// Wait for the next delivery, failing the test on timeout.
pub async fn recv_delivery(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
    tokio::time::timeout(DELIVERY_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery channel closed")
}

/// Assert nothing is delivered within `wait`.
pub async fn assert_no_delivery(rx: &mut mpsc::UnboundedReceiver<Bytes>, wait: Duration) {
    if let Ok(Some(payload)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected delivery: {:?}", payload);
    }
}

/// Unique topic name so concurrent tests never share channels.
pub fn unique_topic(prefix: &str) -> String {
    use std::sync::atomic::AtomicU64;
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!(
        "{}_{}_{}",
        prefix,
        nanos,
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}
