use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Storage errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("empty message batch")]
    EmptyBatch,

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    #[error("non-contiguous batch: expected offset {expected}, got {got}")]
    NonContiguousBatch { expected: u64, got: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
