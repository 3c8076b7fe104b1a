//! Blueplane
//!
//! Local-first telemetry pipeline for AI-assisted coding events. Capture
//! agents enqueue structured events onto an ingress stream; the fast path
//! batches, compresses, and persists them to the raw store and publishes
//! change-data-capture records; a bounded worker pool reconstructs
//! conversations and aggregates metrics off the CDC stream; poison messages
//! land in a journaled dead-letter stream; chain-of-custody counters tie
//! the stages together.
//!
//! [`Pipeline`] is the assembly point; the member crates hold the pieces:
//!
//! - `blueplane-core`: event model and record shapes
//! - `blueplane-stream`: streams with consumer groups
//! - `blueplane-storage`: raw/conversation/metrics stores and custody
//! - `blueplane-fastpath`: batch writer, commit protocol, CDC sweeper
//! - `blueplane-workers`: worker pool, retry policy, depth monitor
//! - `blueplane-builders`: conversation builder and metrics aggregator

mod error;
mod pipeline;

pub use error::{Error, Result};
pub use pipeline::{HealthSnapshot, Pipeline, PipelineConfig, Stores};
