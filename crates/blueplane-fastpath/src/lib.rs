//! Blueplane Fast Path
//!
//! The synchronous sub-pipeline that moves events from the ingress stream
//! into the raw store and emits CDC: micro-batching consumer, three-step
//! commit protocol, poison handling, pending-entry recovery, and the CDC
//! sweeper that backfills failed publishes.

mod config;
mod consumer;
mod counters;
mod error;
mod sweeper;

pub use config::FastPathConfig;
pub use consumer::{enqueue_event, FastPathConsumer};
pub use counters::{FastPathCounters, FastPathStats};
pub use error::{Error, Result};
pub use sweeper::{CdcSweeper, SweeperConfig};
