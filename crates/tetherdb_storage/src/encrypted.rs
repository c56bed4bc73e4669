//! Encrypted storage backend wrapper.
//!
//! Every `append` is sealed as one AES-256-GCM frame on the inner backend:
//!
//! ```text
//! | frame_len: u32 LE | nonce (12 bytes) | ciphertext || tag (16 bytes) |
//! ```
//!
//! `frame_len` counts the nonce, ciphertext and tag. Logical offsets address
//! the concatenated plaintext of all frames; an in-memory frame index built
//! on open maps them back to physical frames. A torn final frame (a crash in
//! the middle of an append) is dropped when the backend is opened.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::RwLock;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const LEN_SIZE: usize = 4;

/// Encryption key for the encrypted backend. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly [`KEY_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::Encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Returns the key as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for EncryptionKey {}

impl std::hash::Hash for EncryptionKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    logical_start: u64,
    plain_len: u64,
    physical_offset: u64,
}

impl Frame {
    fn logical_end(&self) -> u64 {
        self.logical_start + self.plain_len
    }
}

/// An encrypted storage backend that wraps another backend.
///
/// # Example
///
/// ```rust
/// use tetherdb_storage::{EncryptedBackend, EncryptionKey, InMemoryBackend, StorageBackend};
///
/// let key = EncryptionKey::from_bytes(&[7u8; 32]).unwrap();
/// let mut backend = EncryptedBackend::new(Box::new(InMemoryBackend::new()), key).unwrap();
/// backend.append(b"secret").unwrap();
/// assert_eq!(backend.read_all().unwrap(), b"secret");
/// ```
pub struct EncryptedBackend {
    inner: Box<dyn StorageBackend>,
    cipher: Aes256Gcm,
    frames: RwLock<Vec<Frame>>,
}

impl EncryptedBackend {
    /// Wraps `inner`, indexing any frames it already contains.
    ///
    /// # Errors
    ///
    /// Returns an error if the inner backend cannot be read or a complete
    /// frame fails authentication (wrong key or tampered data).
    pub fn new(mut inner: Box<dyn StorageBackend>, key: EncryptionKey) -> StorageResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| StorageError::Encryption(e.to_string()))?;

        let raw = inner.read_all()?;
        let mut frames = Vec::new();
        let mut cursor = 0usize;
        let mut logical = 0u64;

        while cursor + LEN_SIZE <= raw.len() {
            let mut len_bytes = [0u8; LEN_SIZE];
            len_bytes.copy_from_slice(&raw[cursor..cursor + LEN_SIZE]);
            let frame_len = u32::from_le_bytes(len_bytes) as usize;
            let body_start = cursor + LEN_SIZE;
            if frame_len < NONCE_SIZE + TAG_SIZE || body_start + frame_len > raw.len() {
                break;
            }

            let plain = open_frame(&cipher, &raw[body_start..body_start + frame_len])?;
            frames.push(Frame {
                logical_start: logical,
                plain_len: plain.len() as u64,
                physical_offset: cursor as u64,
            });
            logical += plain.len() as u64;
            cursor = body_start + frame_len;
        }

        if cursor < raw.len() {
            inner.truncate(cursor as u64)?;
        }

        Ok(Self {
            inner,
            cipher,
            frames: RwLock::new(frames),
        })
    }

    fn decrypt_frame(&self, frame: &Frame) -> StorageResult<Vec<u8>> {
        let len_bytes = self.inner.read_at(frame.physical_offset, LEN_SIZE)?;
        let mut buf = [0u8; LEN_SIZE];
        buf.copy_from_slice(&len_bytes);
        let frame_len = u32::from_le_bytes(buf) as usize;
        let body = self
            .inner
            .read_at(frame.physical_offset + LEN_SIZE as u64, frame_len)?;
        open_frame(&self.cipher, &body)
    }

    fn logical_size(&self) -> u64 {
        self.frames.read().last().map_or(0, Frame::logical_end)
    }
}

fn open_frame(cipher: &Aes256Gcm, body: &[u8]) -> StorageResult<Vec<u8>> {
    let (nonce, sealed) = body.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| StorageError::Encryption("authentication failed".to_string()))
}

impl StorageBackend for EncryptedBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = self.logical_size();
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        let frames = self.frames.read();
        let mut out = Vec::with_capacity(len);
        for frame in frames
            .iter()
            .filter(|f| f.logical_end() > offset && f.logical_start < end)
        {
            let plain = self.decrypt_frame(frame)?;
            let from = offset.saturating_sub(frame.logical_start) as usize;
            let to = (end.min(frame.logical_end()) - frame.logical_start) as usize;
            out.extend_from_slice(&plain[from..to]);
        }
        Ok(out)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let logical_start = self.logical_size();
        if data.is_empty() {
            return Ok(logical_start);
        }

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| StorageError::Encryption("encryption failed".to_string()))?;

        let frame_len = u32::try_from(NONCE_SIZE + sealed.len())
            .map_err(|_| StorageError::Encryption("frame too large".to_string()))?;
        let mut frame = Vec::with_capacity(LEN_SIZE + frame_len as usize);
        frame.extend_from_slice(&frame_len.to_le_bytes());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&sealed);

        let physical_offset = self.inner.append(&frame)?;
        self.frames.write().push(Frame {
            logical_start,
            plain_len: data.len() as u64,
            physical_offset,
        });
        Ok(logical_start)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.logical_size())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut frames = self.frames.write();
        let size = frames.last().map_or(0, Frame::logical_end);
        if new_size == size {
            return Ok(());
        }

        let keep = frames
            .iter()
            .position(|f| f.logical_start == new_size)
            .ok_or_else(|| {
                StorageError::Encryption(format!(
                    "cannot truncate encrypted storage inside a frame (offset {new_size})"
                ))
            })?;
        let physical = frames[keep].physical_offset;
        self.inner.truncate(physical)?;
        frames.truncate(keep);
        Ok(())
    }
}

impl std::fmt::Debug for EncryptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBackend")
            .field("frames", &self.frames.read().len())
            .finish_non_exhaustive()
    }
}
