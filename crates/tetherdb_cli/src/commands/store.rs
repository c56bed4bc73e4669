//! Locating a store from command-line arguments.

use std::path::{Path, PathBuf};
use tetherdb_core::{CoreError, StaticSchemaMediator, StoreConfiguration};
use tetherdb_storage::{EncryptedBackend, EncryptionKey, FileBackend, StorageBackend, KEY_SIZE};
use thiserror::Error;
use tracing::debug;

/// Errors raised before a command reaches the store.
#[derive(Debug, Error)]
pub enum CliError {
    /// No `--path` was given.
    #[error("store path required for {0}")]
    PathRequired(&'static str),

    /// The store file does not exist.
    #[error("no store found at {}", .0.display())]
    NotFound(PathBuf),

    /// The encryption key is not valid hex of the right length.
    #[error("encryption key must be {expected} hex characters")]
    BadKey {
        /// Expected number of hex characters.
        expected: usize,
    },

    /// A destructive command was not confirmed.
    #[error("refusing to {0} without --yes")]
    NotConfirmed(&'static str),

    /// Store error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] tetherdb_storage::StorageError),
}

/// Parses a hex-encoded encryption key.
pub fn parse_key(hex: &str) -> Result<Vec<u8>, CliError> {
    let bad = CliError::BadKey {
        expected: KEY_SIZE * 2,
    };
    let hex = hex.trim();
    if hex.len() != KEY_SIZE * 2 || !hex.is_ascii() {
        return Err(bad);
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| bad)
}

/// Schema-less configuration for maintenance of the store at `path`.
///
/// Maintenance never touches model classes, so an empty mediator is
/// enough.
pub fn configuration(path: &Path, key: Option<&str>) -> Result<StoreConfiguration, CliError> {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    debug!(path = %path.display(), encrypted = key.is_some(), "configuring store");
    let mut builder = StoreConfiguration::builder()
        .directory(directory)
        .name(name)
        .mediator(StaticSchemaMediator::new(Vec::new())?);
    if let Some(key) = key {
        builder = builder.encryption_key(&parse_key(key)?);
    }
    Ok(builder.build()?)
}

/// Fails with [`CliError::NotFound`] unless `path` exists.
pub fn require_existing(path: &Path) -> Result<(), CliError> {
    if path.exists() {
        Ok(())
    } else {
        Err(CliError::NotFound(path.to_path_buf()))
    }
}

/// Reads the plaintext commit log at `path`, decrypting with `key`.
pub fn read_log(path: &Path, key: Option<&str>) -> Result<Vec<u8>, CliError> {
    require_existing(path)?;
    let file = Box::new(FileBackend::open(path)?);
    let bytes = match key {
        Some(key) => {
            let key = EncryptionKey::from_bytes(&parse_key(key)?)?;
            EncryptedBackend::new(file, key)?.read_all()?
        }
        None => file.read_all()?,
    };
    Ok(bytes)
}
