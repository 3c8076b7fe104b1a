//! Core Error Types
//!
//! Errors produced while parsing and validating events.
//!
//! ## Error Categories
//!
//! ### Schema Errors
//! - `MissingField`: a required payload key for a known event type is absent
//! - `InvalidField`: a payload key is present but carries an unusable value
//!
//! ### Wire Errors
//! - `MalformedEntry`: a stream entry is missing a mandatory field or carries
//!   an unparsable one
//! - `Payload`: the payload field is not valid JSON
//!
//! Schema errors are permanent by definition: retrying the same bytes yields
//! the same failure. Callers route them to the dead-letter stream rather than
//! retrying.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required payload key '{field}' for event type '{event_type}'")]
    MissingField {
        event_type: String,
        field: &'static str,
    },

    #[error("invalid value for payload key '{field}' on event type '{event_type}': {reason}")]
    InvalidField {
        event_type: String,
        field: &'static str,
        reason: String,
    },

    #[error("malformed stream entry: {0}")]
    MalformedEntry(String),

    #[error("payload is not a JSON object: {0}")]
    Payload(#[from] serde_json::Error),
}
