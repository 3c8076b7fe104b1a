//! Stream Error Types
//!
//! Only the journal can fail; in-memory stream operations are infallible.
//! Journal corruption is not an error: corrupt tails are truncated during
//! replay, matching the recovery behavior of a write-ahead log.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
