//! Fast-Path Error Types
//!
//! The fast path swallows everything it can: transient I/O retries in
//! place, poison events go to the DLQ, CDC failures go to the fallback
//! table. The only error that escapes `run` is an invariant violation,
//! which the supervising process treats as fatal so that a restart (and
//! pending-entry recovery) takes over.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invariant violation: {0}")]
    Invariant(String),
}
