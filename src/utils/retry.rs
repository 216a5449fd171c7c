//! Retry utilities: backoff builders for connection recovery.
//!
//! Uses `backon`. The notification listener retries forever with a fixed
//! delay; it never gives up while the bus is alive.

use std::time::Duration;

use backon::ConstantBuilder;

/// Backoff for the PostgreSQL notification listener.
///
/// - Fixed delay between attempts
/// - Unlimited attempts
/// - No jitter
pub fn listener_backoff(delay: Duration) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .without_max_times()
}
