//! Stream Hub
//!
//! The three logical streams of the pipeline, constructed once at startup
//! and shared by reference. Nothing else in the process owns stream state.
//!
//! | Stream    | Producers        | Consumers        | Retention |
//! |-----------|------------------|------------------|-----------|
//! | `ingress` | capture agents   | fast-path group  | bounded   |
//! | `cdc`     | batch writer     | worker pool group| bounded   |
//! | `dlq`     | fast path + pool | operator tooling | unbounded, journaled |

use crate::error::Result;
use crate::stream::{Stream, StreamConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// Stream names, matching what the capture agents were built against.
pub const INGRESS_STREAM: &str = "telemetry:events";
pub const CDC_STREAM: &str = "telemetry:cdc";
pub const DLQ_STREAM: &str = "telemetry:dlq";

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Approximate ingress retention (entries).
    pub ingress_max_len: usize,
    /// Approximate CDC retention (entries).
    pub cdc_max_len: usize,
    /// Journal path for the dead-letter stream; `None` keeps it in memory
    /// (tests only - a real deployment always journals the DLQ).
    pub dlq_journal: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ingress_max_len: 10_000,
            cdc_max_len: 100_000,
            dlq_journal: None,
        }
    }
}

/// The process-wide set of streams.
pub struct StreamHub {
    pub ingress: Arc<Stream>,
    pub cdc: Arc<Stream>,
    pub dlq: Arc<Stream>,
}

impl StreamHub {
    pub async fn open(config: HubConfig) -> Result<Self> {
        let ingress = Arc::new(Stream::new(StreamConfig {
            name: INGRESS_STREAM.to_string(),
            max_len: Some(config.ingress_max_len),
        }));
        let cdc = Arc::new(Stream::new(StreamConfig {
            name: CDC_STREAM.to_string(),
            max_len: Some(config.cdc_max_len),
        }));
        let dlq_config = StreamConfig {
            name: DLQ_STREAM.to_string(),
            max_len: None,
        };
        let dlq = Arc::new(match config.dlq_journal {
            Some(path) => Stream::open_journaled(dlq_config, path).await?,
            None => Stream::new(dlq_config),
        });
        Ok(Self { ingress, cdc, dlq })
    }

    /// Memory-only hub for tests.
    pub fn in_memory() -> Self {
        Self {
            ingress: Arc::new(Stream::new(StreamConfig {
                name: INGRESS_STREAM.to_string(),
                max_len: Some(10_000),
            })),
            cdc: Arc::new(Stream::new(StreamConfig {
                name: CDC_STREAM.to_string(),
                max_len: Some(100_000),
            })),
            dlq: Arc::new(Stream::new(StreamConfig {
                name: DLQ_STREAM.to_string(),
                max_len: None,
            })),
        }
    }
}
