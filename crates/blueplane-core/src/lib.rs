//! Blueplane Core
//!
//! Shared data model for the Blueplane telemetry pipeline: events, event
//! types, payloads, session identity, and the CDC/DLQ record shapes that
//! move between pipeline stages.
//!
//! Everything in this crate is plain data plus validation; all I/O lives in
//! the stream and storage crates.

mod cdc;
mod control;
mod error;
mod event;
mod event_type;
mod payload;
mod session;

pub use cdc::{stage, CdcRecord, DlqRecord, PayloadRef};
pub use control::ShedLevel;
pub use error::{Error, Result};
pub use event::{BatchId, Event, EventId};
pub use event_type::{EventType, FILE_EDIT_OPERATIONS};
pub use payload::Payload;
pub use session::SessionKey;
