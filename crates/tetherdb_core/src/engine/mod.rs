//! The storage engine handles build on.
//!
//! One [`SharedStore`] exists per location per process. It owns the commit
//! log and the latest committed [`StoreState`], and serializes writers with
//! a store-wide lock. Each handle talks to it through its own [`Session`],
//! which reads from a private snapshot and stages writes in a working copy
//! until commit.
//!
//! Committed transactions are appended to the log as CBOR-encoded
//! [`LogRecord`]s; opening a store replays them.

mod record;
mod session;
mod state;
mod store;

pub use record::{decode_log, DecodedLog, LogRecord, RecordKind, LOG_FORMAT, LOG_MAGIC};
pub use session::Session;
pub use state::{Cell, ColumnSpec, ColumnType, Op, Row, StoreState, Table, TableSpec};
pub use store::{compact, delete, is_open, read_state, SharedStore};
