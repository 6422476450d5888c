use thiserror::Error;

use crate::{feed::CacheError, persist::StorageError, pool::PoolError};

/// Error type for the relay manager
#[derive(Debug, Error, Clone)]
pub enum RelayError {
    /// The given address cannot be normalized into a relay URL
    #[error("Invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Storage error
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Connection pool error
    #[error("Relay pool error: {0}")]
    PoolError(String),

    /// Query cache error
    #[error("Query cache error: {0}")]
    CacheError(String),

    #[error("Error: {0}")]
    Generic(String),
}

impl From<StorageError> for RelayError {
    fn from(e: StorageError) -> Self {
        RelayError::StorageError(e.to_string())
    }
}

impl From<PoolError> for RelayError {
    fn from(e: PoolError) -> Self {
        RelayError::PoolError(e.to_string())
    }
}

impl From<CacheError> for RelayError {
    fn from(e: CacheError) -> Self {
        RelayError::CacheError(e.to_string())
    }
}
