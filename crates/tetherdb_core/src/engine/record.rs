//! Commit log records and their on-disk envelope.
//!
//! Each record is laid out as:
//!
//! ```text
//! | magic "TDBC" (4) | format (2) | kind (1) | length (4) | CBOR payload | CRC32 (4) |
//! ```
//!
//! The CRC covers everything before it. All integers are little endian.

use crate::engine::state::{Op, StoreState, Table};
use crate::error::{CoreError, CoreResult};
use crate::types::Version;
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a commit record.
pub const LOG_MAGIC: [u8; 4] = *b"TDBC";

/// Current commit log format version.
pub const LOG_FORMAT: u16 = 1;

/// magic (4) + format (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// Kind of a commit log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Incremental commit.
    Commit = 1,
    /// Full snapshot written by compaction.
    Snapshot = 2,
}

impl RecordKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Commit),
            2 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// A commit log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogRecord {
    /// Operations of one committed write transaction.
    Commit {
        /// Version produced by the commit.
        version: Version,
        /// Operations in the order they were applied.
        ops: Vec<Op>,
    },
    /// Complete state at a version; replaces everything before it.
    Snapshot {
        /// Version of the snapshot.
        version: Version,
        /// Stamped schema version.
        schema_version: Option<u64>,
        /// Every table.
        tables: Vec<Table>,
    },
}

impl LogRecord {
    /// Builds a snapshot record of `state`.
    #[must_use]
    pub fn snapshot(state: &StoreState) -> Self {
        Self::Snapshot {
            version: state.version(),
            schema_version: state.schema_version(),
            tables: state.to_snapshot(),
        }
    }

    /// Record kind.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Commit { .. } => RecordKind::Commit,
            Self::Snapshot { .. } => RecordKind::Snapshot,
        }
    }

    /// Version this record brings the store to.
    #[must_use]
    pub fn version(&self) -> Version {
        match self {
            Self::Commit { version, .. } | Self::Snapshot { version, .. } => *version,
        }
    }

    /// Encodes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails or the payload does not
    /// fit the 4-byte length field.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload)
            .map_err(|e| CoreError::codec(format!("encode commit record: {e}")))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::codec("commit record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_FORMAT.to_le_bytes());
        data.push(self.kind() as u8);
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Applies this record on top of `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if an operation no longer applies, which means the
    /// log does not describe a consistent history.
    pub fn replay(self, state: &mut StoreState) -> CoreResult<()> {
        match self {
            Self::Commit { version, ops } => {
                for op in &ops {
                    state.apply(op).map_err(|e| {
                        CoreError::log_corruption(format!("replaying {version}: {e}"))
                    })?;
                }
                state.set_version(version);
            }
            Self::Snapshot {
                version,
                schema_version,
                tables,
            } => {
                *state = StoreState::from_snapshot(version, schema_version, tables)?;
            }
        }
        Ok(())
    }
}

/// Outcome of decoding a log image.
#[derive(Debug)]
pub struct DecodedLog {
    /// Complete records, in log order.
    pub records: Vec<LogRecord>,
    /// Length of the prefix made of complete records.
    pub valid_len: usize,
}

impl DecodedLog {
    /// Returns true if bytes after the last complete record were ignored.
    #[must_use]
    pub fn has_torn_tail(&self, total_len: usize) -> bool {
        self.valid_len < total_len
    }
}

/// Decodes every complete record in `bytes`.
///
/// An incomplete final record is treated as a torn write and ignored.
///
/// # Errors
///
/// Returns a log corruption error for a bad magic, unknown format or kind,
/// CRC mismatch, or undecodable payload in a complete record.
pub fn decode_log(bytes: &[u8]) -> CoreResult<DecodedLog> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < HEADER_SIZE {
            break;
        }
        if rest[..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(format!("bad magic at offset {offset}")));
        }
        let format = u16::from_le_bytes([rest[4], rest[5]]);
        if format != LOG_FORMAT {
            return Err(CoreError::log_corruption(format!(
                "unsupported log format {format} at offset {offset}"
            )));
        }
        let kind = RecordKind::from_byte(rest[6]).ok_or_else(|| {
            CoreError::log_corruption(format!("unknown record kind {} at offset {offset}", rest[6]))
        })?;
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            break;
        }

        let body_end = HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        if crc32fast::hash(&rest[..body_end]) != stored {
            return Err(CoreError::log_corruption(format!(
                "checksum mismatch at offset {offset}"
            )));
        }

        let record: LogRecord = ciborium::from_reader(&rest[HEADER_SIZE..body_end])
            .map_err(|e| CoreError::log_corruption(format!("decode at offset {offset}: {e}")))?;
        if record.kind() != kind {
            return Err(CoreError::log_corruption(format!(
                "record kind mismatch at offset {offset}"
            )));
        }
        records.push(record);
        offset += total;
    }

    Ok(DecodedLog {
        records,
        valid_len: offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{ColumnSpec, ColumnType, TableSpec};

    fn commit(version: u64) -> LogRecord {
        LogRecord::Commit {
            version: Version(version),
            ops: vec![
                Op::CreateTable(TableSpec {
                    name: format!("t{version}"),
                    columns: vec![ColumnSpec {
                        name: "n".into(),
                        column_type: ColumnType::Integer,
                        nullable: false,
                    }],
                    primary_key: None,
                }),
                Op::SetSchemaVersion(version),
            ],
        }
    }

    #[test]
    fn decode_reads_back_records() {
        let mut bytes = commit(1).encode().unwrap();
        bytes.extend(commit(2).encode().unwrap());

        let decoded = decode_log(&bytes).unwrap();
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[1].version(), Version(2));
        assert!(!decoded.has_torn_tail(bytes.len()));

        let mut state = StoreState::default();
        for record in decoded.records {
            record.replay(&mut state).unwrap();
        }
        assert_eq!(state.version(), Version(2));
        assert_eq!(state.schema_version(), Some(2));
        assert_eq!(state.table_names().count(), 2);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let first = commit(1).encode().unwrap();
        let second = commit(2).encode().unwrap();
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second[..second.len() - 3]);

        let decoded = decode_log(&bytes).unwrap();
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.valid_len, first.len());
        assert!(decoded.has_torn_tail(bytes.len()));
    }

    #[test]
    fn checksum_mismatch_is_corruption() {
        let mut bytes = commit(1).encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        let err = decode_log(&bytes).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::IoFailure);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = commit(1).encode().unwrap();
        bytes[0] = b'X';
        assert!(decode_log(&bytes).is_err());
    }

    proptest::proptest! {
        #[test]
        fn any_truncation_decodes_a_prefix(count in 1u64..6, cut in proptest::num::usize::ANY) {
            let mut bytes = Vec::new();
            let mut ends = vec![0];
            for version in 1..=count {
                bytes.extend(commit(version).encode().unwrap());
                ends.push(bytes.len());
            }
            let cut = cut % (bytes.len() + 1);

            let decoded = decode_log(&bytes[..cut]).unwrap();
            let complete = ends.iter().filter(|&&end| end <= cut).count() - 1;
            proptest::prop_assert_eq!(decoded.records.len(), complete);
            proptest::prop_assert_eq!(decoded.valid_len, ends[complete]);
        }
    }
}
