// Error types for cache stores.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache connection failed: {0}")]
    Connection(String),

    #[error("cache operation failed: {0}")]
    Operation(String),

    #[error("cache operation timed out")]
    Timeout,
}

pub type CacheResult<T> = Result<T, CacheError>;
