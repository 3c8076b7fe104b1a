//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### I/O and Encoding
//! - `Sqlx`: database operation failed (transient from the caller's view)
//! - `Encoding` / `Decompress`: blob (de)serialization failed
//!
//! ### Data Errors
//! - `UnknownCodec`: a raw batch carries a codec byte this build cannot read
//! - `BatchNotFound`: a CDC reference points at a batch that is not readable
//! - `Corrupted`: a batch decompressed to something other than what its
//!   header promised
//!
//! ### Invariants
//! - `InvariantViolation`: internal inconsistency (e.g. batch ids going
//!   backward). Callers fail fast on this one; everything else is retryable
//!   or permanent per the pipeline's retry taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("unknown codec version: {0}")]
    UnknownCodec(u8),

    #[error("batch {0} not found")]
    BatchNotFound(i64),

    #[error("batch {batch_id} corrupted: {detail}")]
    Corrupted { batch_id: i64, detail: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("cannot append an empty batch")]
    EmptyBatch,

    #[error("bad stored timestamp: {0}")]
    BadTimestamp(String),
}

impl Error {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Sqlx(_) | Error::BatchNotFound(_))
    }
}
