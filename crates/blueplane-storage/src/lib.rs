//! Blueplane Storage
//!
//! The three persistent stores of the pipeline plus the chain-of-custody
//! ledger:
//!
//! - [`RawStore`]: append-only compressed event log, the durability anchor
//! - [`ConversationStore`]: reconstructed sessions and turns
//! - [`MetricsStore`]: rolling counters, gauges, and histograms with
//!   idempotent keyed updates
//! - [`CustodyLedger`]: per-minute stage counters and chain-break detection
//!
//! Each store is a trait with a SQLite implementation; builders and the
//! fast path are parameterized by the traits so tests can substitute
//! in-memory databases.

mod codec;
mod conversation;
mod custody;
mod error;
mod metrics;
mod raw;
pub mod timefmt;

pub use codec::{decode_batch, encode_batch, CODEC_LZ4, CODEC_NONE};
pub use conversation::{
    Accepted, ConversationStore, SessionRow, SessionStatus, SqliteConversationStore, ToolUse,
    TurnRow, CONVERSATION_BUILDER_ID,
};
pub use custody::{
    CustodyLedger, CC_CDC_PUBLISHED, CC_DERIVED_APPLIED, CC_DLQ_TOTAL, CC_INGRESS_ENQUEUED,
    CC_RAW_PERSISTED,
};
pub use error::{Error, Result};
pub use metrics::{
    day_bucket, hour_bucket, labels, le_bucket, minute_bucket, MetricDelta, MetricKey, MetricOp,
    MetricScope, MetricsStore, SqliteMetricsStore, LATENCY_BUCKETS_MS, NO_BUCKET,
};
pub use raw::{RawStore, SqliteRawStore};
