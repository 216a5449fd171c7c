//! Notibus - notification bus
//!
//! One publish/subscribe contract over four delivery backends: in-process
//! fan-out, NATS, Redis pub/sub and PostgreSQL LISTEN/NOTIFY.

pub mod bus;
pub mod config;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{init_bus, Bus, BusClients, BusConfig, BusDriver, BusError, BusExt, Handler, Payload};
