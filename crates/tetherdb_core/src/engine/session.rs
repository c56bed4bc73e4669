//! Thread-confined sessions on a shared store.

use crate::config::StoreConfiguration;
use crate::engine::state::{Cell, ColumnSpec, Op, StoreState, TableSpec};
use crate::engine::store::{SharedStore, WriteGuard};
use crate::error::{CoreError, CoreResult};
use crate::types::{PrimaryKey, RowId, SessionId, Version};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// An open write transaction.
struct WriteScope {
    guard: WriteGuard,
    working: StoreState,
    ops: Vec<Op>,
}

/// A session: a snapshot of a shared store plus at most one write
/// transaction.
///
/// Reads see the snapshot the session last refreshed to, or the working
/// state of the open write transaction. Writes from other sessions become
/// visible only on [`refresh`](Self::refresh) or [`begin_write`](Self::begin_write).
pub struct Session {
    id: SessionId,
    store: Option<Arc<SharedStore>>,
    snapshot: Arc<StoreState>,
    write: Option<WriteScope>,
}

impl Session {
    /// Opens a session on the store `config` names.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    pub fn open(config: &StoreConfiguration) -> CoreResult<Self> {
        let store = SharedStore::open(config)?;
        let snapshot = store.latest();
        Ok(Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            store: Some(store),
            snapshot,
            write: None,
        })
    }

    /// Session ID.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns true until [`close`](Self::close) is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self) -> CoreResult<&Arc<SharedStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| CoreError::invalid_state("session is closed"))
    }

    /// Display form of the store location, for error messages.
    #[must_use]
    pub fn location_name(&self) -> String {
        self.store
            .as_ref()
            .map_or_else(|| "<closed>".to_string(), |s| s.config().location().to_string())
    }

    /// The state reads observe.
    #[must_use]
    pub fn state(&self) -> &StoreState {
        match &self.write {
            Some(scope) => &scope.working,
            None => &self.snapshot,
        }
    }

    /// Version of the snapshot this session reads from.
    #[must_use]
    pub fn version(&self) -> Version {
        self.snapshot.version()
    }

    /// Stamped schema version.
    #[must_use]
    pub fn schema_version(&self) -> Option<u64> {
        self.state().schema_version()
    }

    /// Returns true while a write transaction is open.
    #[must_use]
    pub fn is_in_write(&self) -> bool {
        self.write.is_some()
    }

    /// Moves the snapshot to the latest committed version.
    ///
    /// Returns true if the version changed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` inside a write transaction or on a closed
    /// session.
    pub fn refresh(&mut self) -> CoreResult<bool> {
        if self.write.is_some() {
            return Err(CoreError::invalid_state(
                "cannot refresh inside a write transaction",
            ));
        }
        let latest = self.store()?.latest();
        let changed = latest.version() != self.snapshot.version();
        self.snapshot = latest;
        Ok(changed)
    }

    /// Starts a write transaction.
    ///
    /// Blocks until no other session on the store is writing, then moves to
    /// the latest committed version.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a write transaction is already open or the
    /// session is closed.
    pub fn begin_write(&mut self) -> CoreResult<()> {
        if self.write.is_some() {
            return Err(CoreError::invalid_state(
                "a write transaction is already open",
            ));
        }
        let store = Arc::clone(self.store()?);
        let guard = store.lock_writer();
        self.snapshot = store.latest();
        self.write = Some(WriteScope {
            guard,
            working: StoreState::clone(&self.snapshot),
            ops: Vec::new(),
        });
        Ok(())
    }

    /// Commits the open write transaction and returns the new version.
    ///
    /// On failure the transaction is discarded and the write lock released.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without an open write transaction, or
    /// `CommitFailure` if the log rejects the commit.
    pub fn commit(&mut self) -> CoreResult<Version> {
        let store = Arc::clone(self.store()?);
        let WriteScope {
            guard,
            working,
            ops,
        } = self
            .write
            .take()
            .ok_or_else(|| CoreError::invalid_state("no write transaction is open"))?;

        if ops.is_empty() {
            drop(guard);
            return Ok(self.snapshot.version());
        }
        let result = store.publish(working, ops);
        drop(guard);
        self.snapshot = result?;
        Ok(self.snapshot.version())
    }

    /// Discards the open write transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without an open write transaction.
    pub fn cancel(&mut self) -> CoreResult<()> {
        self.write
            .take()
            .map(drop)
            .ok_or_else(|| CoreError::invalid_state("no write transaction is open"))
    }

    /// Closes the session, discarding any open write transaction.
    pub fn close(&mut self) {
        self.write = None;
        self.store = None;
    }

    fn mutate(&mut self, op: Op) -> CoreResult<()> {
        if self.store.is_none() {
            return Err(CoreError::invalid_state("session is closed"));
        }
        let scope = self
            .write
            .as_mut()
            .ok_or_else(|| CoreError::invalid_state("not in a write transaction"))?;
        scope.working.apply(&op)?;
        scope.ops.push(op);
        Ok(())
    }

    /// Creates a table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a write transaction, or
    /// `InvalidArgument` if the table exists.
    pub fn create_table(&mut self, spec: TableSpec) -> CoreResult<()> {
        self.mutate(Op::CreateTable(spec))
    }

    /// Drops a table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table is missing or still linked.
    pub fn drop_table(&mut self, table: &str) -> CoreResult<()> {
        self.mutate(Op::DropTable {
            table: table.to_string(),
        })
    }

    /// Appends a column to a table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the column exists.
    pub fn add_column(&mut self, table: &str, column: ColumnSpec) -> CoreResult<()> {
        self.mutate(Op::AddColumn {
            table: table.to_string(),
            column,
        })
    }

    /// Removes a column from a table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a missing or primary key column.
    pub fn remove_column(&mut self, table: &str, column: &str) -> CoreResult<()> {
        self.mutate(Op::RemoveColumn {
            table: table.to_string(),
            column: column.to_string(),
        })
    }

    /// Adds a row with default cells to a table without a primary key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table is missing or has a primary
    /// key.
    pub fn add_empty_row(&mut self, table: &str) -> CoreResult<RowId> {
        let row = self.state().next_row_id(table)?;
        self.mutate(Op::InsertRow {
            table: table.to_string(),
            row,
            key: None,
        })?;
        Ok(row)
    }

    /// Adds a row with default cells and the given primary key.
    ///
    /// # Errors
    ///
    /// Returns `PrimaryKeyConstraintViolation` if a row with that key
    /// exists.
    pub fn add_empty_row_with_key(&mut self, table: &str, key: PrimaryKey) -> CoreResult<RowId> {
        let row = self.state().next_row_id(table)?;
        self.mutate(Op::InsertRow {
            table: table.to_string(),
            row,
            key: Some(key),
        })?;
        Ok(row)
    }

    /// Looks up a row by primary key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table is missing.
    pub fn find_by_primary_key(&self, table: &str, key: &PrimaryKey) -> CoreResult<Option<RowId>> {
        Ok(self.state().require_table(table)?.find(key))
    }

    /// Reads one cell.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table, row or column is missing.
    pub fn get_cell(&self, table: &str, row: RowId, column: usize) -> CoreResult<&Cell> {
        self.state().cell(table, row, column)
    }

    /// Overwrites one cell.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on type mismatch or a dangling link, or
    /// `PrimaryKeyConstraintViolation` when changing a key to a taken one.
    pub fn set_cell(&mut self, table: &str, row: RowId, column: usize, cell: Cell) -> CoreResult<()> {
        self.mutate(Op::SetCell {
            table: table.to_string(),
            row,
            column,
            cell,
        })
    }

    /// Deletes a row and clears links to it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the row is missing.
    pub fn delete_row(&mut self, table: &str, row: RowId) -> CoreResult<()> {
        self.mutate(Op::DeleteRow {
            table: table.to_string(),
            row,
        })
    }

    /// Deletes every row of a table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table is missing.
    pub fn clear_table(&mut self, table: &str) -> CoreResult<()> {
        self.mutate(Op::ClearTable {
            table: table.to_string(),
        })
    }

    /// Stamps the schema version.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a write transaction.
    pub fn set_schema_version(&mut self, version: u64) -> CoreResult<()> {
        self.mutate(Op::SetSchemaVersion(version))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("version", &self.snapshot.version())
            .field("in_write", &self.write.is_some())
            .field("open", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::ColumnType;
    use crate::schema::{ObjectSchema, StaticSchemaMediator};
    use crate::value::Value;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tetherdb_storage::InMemoryBackend;

    fn config(name: &str, buffer: &InMemoryBackend) -> StoreConfiguration {
        StoreConfiguration::builder()
            .in_memory_backend(name, buffer.clone())
            .mediator(StaticSchemaMediator::new(vec![ObjectSchema::builder("A").build().unwrap()]).unwrap())
            .build()
            .unwrap()
    }

    fn keyed_table() -> TableSpec {
        TableSpec {
            name: "people".into(),
            columns: vec![
                ColumnSpec {
                    name: "id".into(),
                    column_type: ColumnType::Integer,
                    nullable: false,
                },
                ColumnSpec {
                    name: "name".into(),
                    column_type: ColumnType::Text,
                    nullable: true,
                },
            ],
            primary_key: Some("id".into()),
        }
    }

    #[test]
    fn writes_are_invisible_until_refresh() {
        let buffer = InMemoryBackend::new();
        let cfg = config("session-visibility", &buffer);
        let mut writer = Session::open(&cfg).unwrap();
        let mut reader = Session::open(&cfg).unwrap();

        writer.begin_write().unwrap();
        writer.create_table(keyed_table()).unwrap();
        let row = writer.add_empty_row_with_key("people", PrimaryKey::Integer(1)).unwrap();
        writer
            .set_cell("people", row, 1, Cell::Value(Value::from("a")))
            .unwrap();
        assert!(reader.state().table("people").is_none());

        let version = writer.commit().unwrap();
        assert!(reader.state().table("people").is_none());
        assert!(reader.refresh().unwrap());
        assert_eq!(reader.version(), version);
        assert_eq!(
            reader.get_cell("people", row, 1).unwrap(),
            &Cell::Value(Value::from("a"))
        );
    }

    #[test]
    fn cancel_discards_changes() {
        let buffer = InMemoryBackend::new();
        let cfg = config("session-cancel", &buffer);
        let mut session = Session::open(&cfg).unwrap();
        session.begin_write().unwrap();
        session.create_table(keyed_table()).unwrap();
        session.cancel().unwrap();
        assert!(session.state().table("people").is_none());
        assert!(session.cancel().is_err());
        assert_eq!(session.version(), Version(0));
    }

    #[test]
    fn mutation_requires_write() {
        let buffer = InMemoryBackend::new();
        let cfg = config("session-readonly", &buffer);
        let mut session = Session::open(&cfg).unwrap();
        let err = session.create_table(keyed_table()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidState);
        session.begin_write().unwrap();
        assert!(session.begin_write().is_err());
        assert!(session.refresh().is_err());
    }

    #[test]
    fn duplicate_key_row() {
        let buffer = InMemoryBackend::new();
        let cfg = config("session-duplicate", &buffer);
        let mut session = Session::open(&cfg).unwrap();
        session.begin_write().unwrap();
        session.create_table(keyed_table()).unwrap();
        session.add_empty_row_with_key("people", PrimaryKey::Integer(1)).unwrap();
        let err = session
            .add_empty_row_with_key("people", PrimaryKey::Integer(1))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PrimaryKeyConstraintViolation);
        assert!(session.add_empty_row("people").is_err());
        assert_eq!(
            session
                .find_by_primary_key("people", &PrimaryKey::Integer(1))
                .unwrap(),
            Some(RowId(0))
        );
    }

    #[test]
    fn commit_failure_releases_write_lock() {
        let buffer = InMemoryBackend::new();
        let cfg = config("session-commit-failure", &buffer);
        let mut session = Session::open(&cfg).unwrap();
        session.begin_write().unwrap();
        session.create_table(keyed_table()).unwrap();
        buffer.set_fail_writes(true);

        let err = session.commit().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CommitFailure);
        assert!(!session.is_in_write());
        assert!(session.state().table("people").is_none());

        buffer.set_fail_writes(false);
        session.begin_write().unwrap();
        session.create_table(keyed_table()).unwrap();
        assert_eq!(session.commit().unwrap(), Version(1));
    }

    #[test]
    fn writers_serialize() {
        let buffer = InMemoryBackend::new();
        let cfg = config("session-serialize", &buffer);
        let mut first = Session::open(&cfg).unwrap();
        first.begin_write().unwrap();

        let (tx, rx) = mpsc::channel();
        let cfg2 = cfg.clone();
        let worker = thread::spawn(move || {
            let mut second = Session::open(&cfg2).unwrap();
            second.begin_write().unwrap();
            tx.send(second.version()).unwrap();
            second.cancel().unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        first.create_table(keyed_table()).unwrap();
        first.commit().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Version(1));
        worker.join().unwrap();
    }

    #[test]
    fn closed_session_rejects_work() {
        let buffer = InMemoryBackend::new();
        let cfg = config("session-closed", &buffer);
        let mut session = Session::open(&cfg).unwrap();
        session.close();
        assert!(!session.is_open());
        assert!(session.begin_write().is_err());
        assert!(session.refresh().is_err());
    }
}
