//! # TetherDB Storage
//!
//! Storage backend trait and implementations for TetherDB.
//!
//! Backends are **opaque byte stores**: they append, read back and flush
//! bytes, and know nothing about commit records, tables or rows. The commit
//! log in `tetherdb_core` owns all format interpretation.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - Shared in-memory buffer, with a write-fault switch for tests
//! - [`FileBackend`] - Persistent storage using OS file APIs
//! - [`EncryptedBackend`] - Wrapper that adds AES-256-GCM encryption at rest
//!
//! ## Example
//!
//! ```rust
//! use tetherdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod encrypted;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use encrypted::{EncryptedBackend, EncryptionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
