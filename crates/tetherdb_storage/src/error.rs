//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The stored bytes could not be interpreted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A write was rejected by the backend (for example, the device is full).
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// Encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),
}

impl StorageError {
    /// Returns true if the error was raised while persisting data.
    #[must_use]
    pub fn is_write_failure(&self) -> bool {
        matches!(self, Self::WriteRejected(_) | Self::Io(_))
    }
}
