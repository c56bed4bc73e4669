//! Error types for TetherDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Null, negative or malformed input, detected before touching storage.
    InvalidArgument,
    /// Misuse of the handle or transaction state machine.
    InvalidState,
    /// On-disk schema does not match the configuration.
    SchemaMismatch,
    /// Duplicate primary key on insert.
    PrimaryKeyConstraintViolation,
    /// File open, read or write failure.
    IoFailure,
    /// Storage-level commit rejection.
    CommitFailure,
    /// A mutation body asked for its transaction to be rolled back.
    Aborted,
    /// A migration callback failed.
    Migration,
}

/// Errors that can occur in TetherDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tetherdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid input.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid input.
        message: String,
    },

    /// Operation not permitted in the current handle or transaction state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the operation is not permitted.
        message: String,
    },

    /// The on-disk schema does not match the configured one.
    #[error("schema mismatch for {path}: {message}")]
    SchemaMismatch {
        /// Store location.
        path: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A row with the same primary key already exists.
    #[error("primary key constraint violation: {class} already has an object with key {key}")]
    PrimaryKeyConstraintViolation {
        /// Class whose table rejected the row.
        class: String,
        /// Display form of the duplicate key.
        key: String,
    },

    /// The commit log could not be read back.
    #[error("commit log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// The storage engine refused to persist a commit.
    #[error("commit failed: {message}")]
    CommitFailed {
        /// Description of the failure.
        message: String,
    },

    /// Encoding or decoding a commit record failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Transaction was aborted by its mutation body.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a schema mismatch error.
    pub fn schema_mismatch(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a primary key constraint violation.
    pub fn primary_key_violation(class: impl Into<String>, key: impl std::fmt::Display) -> Self {
        Self::PrimaryKeyConstraintViolation {
            class: class.into(),
            key: key.to_string(),
        }
    }

    /// Creates a commit log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates a commit failure.
    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Returns the taxonomy bucket of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::PrimaryKeyConstraintViolation { .. } => ErrorKind::PrimaryKeyConstraintViolation,
            Self::Storage(_) | Self::Io(_) | Self::LogCorruption { .. } | Self::Codec { .. } => {
                ErrorKind::IoFailure
            }
            Self::CommitFailed { .. } => ErrorKind::CommitFailure,
            Self::TransactionAborted { .. } => ErrorKind::Aborted,
            Self::MigrationFailed { .. } => ErrorKind::Migration,
        }
    }

    /// Returns true for caller errors that are surfaced synchronously and
    /// never retried.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArgument | ErrorKind::InvalidState
        )
    }
}
