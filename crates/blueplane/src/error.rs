//! Pipeline Assembly Errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("stream error: {0}")]
    Stream(#[from] blueplane_stream::Error),

    #[error("storage error: {0}")]
    Storage(#[from] blueplane_storage::Error),
}
