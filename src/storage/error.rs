//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer.

use std::time::Instant;
use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// Series key could not be parsed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Invalid time range (start >= end)
    #[error("Invalid time range: start must be less than end")]
    InvalidTimeRange,

    /// A dictionary id was not produced by the dictionary resolving it
    #[error("Unknown dictionary id: {0}")]
    UnknownId(u32),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistent store rejected an operation
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Caller-supplied deadline passed before the operation completed
    #[error("Operation timed out")]
    Timeout,

    /// Internal cache lookup found nothing, in memory or on disk
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage was already closed
    #[error("Storage is closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the error was caused by malformed caller input
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidKey(_) | StorageError::InvalidTimeRange
        )
    }

    /// Whether the error came from the persistence layer
    pub fn is_io(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Persistence(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Persistence(err.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// `Timeout` once `deadline` has passed
pub(crate) fn check_deadline(deadline: Option<Instant>) -> StorageResult<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(StorageError::Timeout),
        _ => Ok(()),
    }
}
