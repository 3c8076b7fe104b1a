//! Stored Timestamp Format
//!
//! Timestamps are persisted as fixed-width RFC 3339 UTC strings
//! (microsecond precision, `Z` suffix) so that lexicographic comparison in
//! SQL matches chronological order.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};

pub fn encode(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::BadTimestamp(format!("'{raw}': {e}")))
}
