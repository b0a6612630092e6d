//! Cache error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("Schema mismatch: expected v{expected}, found v{found}")]
    SchemaMismatch { expected: u32, found: u32 },

    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(String),
}

impl CacheError {
    /// Errors that mean "the bytes on disk cannot be trusted" rather than
    /// "the backend is unreachable". Both are treated as a miss on read.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CacheError::Corrupt(_)
                | CacheError::SchemaMismatch { .. }
                | CacheError::ChecksumMismatch(_)
                | CacheError::Encode(_)
        )
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
