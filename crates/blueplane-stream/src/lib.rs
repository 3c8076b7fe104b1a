//! Blueplane Streams
//!
//! Append-only ordered logs with consumer groups - the transport between
//! capture agents, the fast path, and the worker pool. See [`Stream`] for
//! delivery semantics and [`StreamHub`] for the process-wide wiring.

mod entry;
mod error;
mod hub;
mod journal;
mod stream;

pub use entry::{ClaimedEntry, EntryId, StreamEntry};
pub use error::{Error, Result};
pub use hub::{HubConfig, StreamHub, CDC_STREAM, DLQ_STREAM, INGRESS_STREAM};
pub use journal::Journal;
pub use stream::{Stream, StreamConfig};
