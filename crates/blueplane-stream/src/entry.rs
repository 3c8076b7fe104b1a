//! Stream Entries
//!
//! An entry is an id plus a flat string field map - the shape capture agents
//! write and every consumer reads. Ids are assigned by the stream at append
//! time and increase monotonically within one stream.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Monotonic id of an entry within a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single entry in a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: BTreeMap<String, String>,
}

/// An entry re-delivered by [`claim_stuck`](crate::Stream::claim_stuck),
/// together with how many times it has now been delivered.
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    pub entry: StreamEntry,
    pub delivery_count: u32,
}
