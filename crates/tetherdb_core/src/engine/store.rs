//! Shared per-location store state and its commit log.

use crate::config::{LocationKey, StoreConfiguration, StoreLocation};
use crate::engine::record::{decode_log, LogRecord};
use crate::engine::state::{Op, StoreState};
use crate::error::{CoreError, CoreResult};
use once_cell::sync::Lazy;
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tetherdb_storage::{
    EncryptedBackend, EncryptionKey, FileBackend, InMemoryBackend, StorageBackend,
};
use tracing::{debug, warn};

/// Guard proving the holder is the only writer of a store.
pub(crate) type WriteGuard = ArcMutexGuard<RawMutex, ()>;

/// Per-location slot. Opening, closing checks and maintenance of one
/// location serialize on it; other locations never wait.
type Slot = Arc<Mutex<Weak<SharedStore>>>;

/// Every store location seen in this process.
static OPEN_STORES: Lazy<Mutex<HashMap<LocationKey, Slot>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the slot for `key`, creating it if needed. The map lock is held
/// only for the lookup.
fn slot(key: LocationKey) -> Slot {
    let mut stores = OPEN_STORES.lock();
    stores.retain(|_, slot| {
        Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |s| s.strong_count() > 0)
    });
    Arc::clone(stores.entry(key).or_default())
}

/// Append-only log of commit records over a storage backend.
pub(crate) struct CommitLog {
    backend: Box<dyn StorageBackend>,
    sync_on_commit: bool,
}

impl CommitLog {
    /// Replays `backend` into a state and returns the log positioned for
    /// appends. A torn final record is cut off.
    pub(crate) fn open(
        mut backend: Box<dyn StorageBackend>,
        sync_on_commit: bool,
    ) -> CoreResult<(Self, StoreState)> {
        let bytes = backend.read_all()?;
        let decoded = decode_log(&bytes)?;
        if decoded.has_torn_tail(bytes.len()) {
            warn!(
                valid = decoded.valid_len,
                total = bytes.len(),
                "discarding incomplete commit record at end of log"
            );
            backend.truncate(decoded.valid_len as u64)?;
        }

        let mut state = StoreState::default();
        for record in decoded.records {
            record.replay(&mut state)?;
        }
        Ok((
            Self {
                backend,
                sync_on_commit,
            },
            state,
        ))
    }

    /// Appends a record and makes it durable.
    ///
    /// On failure the log is cut back to where it was.
    pub(crate) fn append(&mut self, record: &LogRecord) -> CoreResult<()> {
        let data = record.encode()?;
        let before = self.backend.size()?;
        let written = self.backend.append(&data).and_then(|_| {
            self.backend.flush()?;
            if self.sync_on_commit {
                self.backend.sync()?;
            }
            Ok(())
        });
        if let Err(e) = written {
            if let Err(undo) = self.backend.truncate(before) {
                warn!(error = %undo, "could not cut back failed commit record");
            }
            return Err(CoreError::commit_failed(e.to_string()));
        }
        Ok(())
    }

    /// Replaces the whole log with a single record.
    pub(crate) fn rewrite(&mut self, record: &LogRecord) -> CoreResult<()> {
        let data = record.encode()?;
        self.backend.truncate(0)?;
        self.backend.append(&data)?;
        self.backend.flush()?;
        self.backend.sync()?;
        Ok(())
    }
}

/// Opens the raw backend for `location`.
pub(crate) fn open_backend(
    location: &StoreLocation,
    key: Option<&EncryptionKey>,
) -> CoreResult<Box<dyn StorageBackend>> {
    let base: Box<dyn StorageBackend> = match location {
        StoreLocation::File(path) => Box::new(FileBackend::open_with_create_dirs(path)?),
        StoreLocation::Memory { backend, .. } => {
            Box::new(backend.clone().unwrap_or_else(InMemoryBackend::new))
        }
    };
    match key {
        Some(key) => Ok(Box::new(EncryptedBackend::new(base, key.clone())?)),
        None => Ok(base),
    }
}

/// One open store, shared by every session on its location.
///
/// Holds the latest committed state, the commit log and the store-wide
/// write lock. Sessions keep it alive; it closes when the last one goes.
pub struct SharedStore {
    config: StoreConfiguration,
    committed: RwLock<Arc<StoreState>>,
    write_lock: Arc<Mutex<()>>,
    log: Mutex<CommitLog>,
}

impl SharedStore {
    /// Returns the open store for the configured location, opening it if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the location is already open under a
    /// different configuration, and an I/O error if the log cannot be read.
    pub fn open(config: &StoreConfiguration) -> CoreResult<Arc<Self>> {
        let slot = slot(config.location().key());
        let mut current = slot.lock();

        if let Some(store) = current.upgrade() {
            if store.config != *config {
                return Err(CoreError::invalid_argument(format!(
                    "{} is already open with a different configuration",
                    config.location()
                )));
            }
            return Ok(store);
        }

        let backend = open_backend(config.location(), config.encryption_key())?;
        let (log, state) = CommitLog::open(backend, config.sync_on_commit())?;
        debug!(location = %config.location(), version = %state.version(), "opened store");

        let store = Arc::new(Self {
            config: config.clone(),
            committed: RwLock::new(Arc::new(state)),
            write_lock: Arc::new(Mutex::new(())),
            log: Mutex::new(log),
        });
        *current = Arc::downgrade(&store);
        Ok(store)
    }

    /// Configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfiguration {
        &self.config
    }

    /// Latest committed state.
    #[must_use]
    pub fn latest(&self) -> Arc<StoreState> {
        self.committed.read().clone()
    }

    /// Blocks until the caller is the only writer.
    pub(crate) fn lock_writer(&self) -> WriteGuard {
        self.write_lock.lock_arc()
    }

    /// Logs `ops` and publishes `working` as the next version.
    ///
    /// The caller must hold the write guard.
    pub(crate) fn publish(
        &self,
        mut working: StoreState,
        ops: Vec<Op>,
    ) -> CoreResult<Arc<StoreState>> {
        let mut log = self.log.lock();
        let version = self.committed.read().version().next();
        log.append(&LogRecord::Commit { version, ops })?;

        working.set_version(version);
        let published = Arc::new(working);
        *self.committed.write() = Arc::clone(&published);
        Ok(published)
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("location", self.config.location())
            .field("version", &self.committed.read().version())
            .finish_non_exhaustive()
    }
}

/// Returns true if some session in this process has `location` open.
///
/// Waits while the location is being opened or maintained.
#[must_use]
pub fn is_open(location: &StoreLocation) -> bool {
    let slot = OPEN_STORES.lock().get(&location.key()).cloned();
    slot.is_some_and(|slot| slot.lock().strong_count() > 0)
}

/// Runs `action` on a closed store. Opening the location waits until it
/// returns.
fn while_closed<T>(
    config: &StoreConfiguration,
    verb: &str,
    action: impl FnOnce() -> CoreResult<T>,
) -> CoreResult<T> {
    let slot = slot(config.location().key());
    let current = slot.lock();
    if current.strong_count() > 0 {
        return Err(CoreError::invalid_state(format!(
            "cannot {verb} {} while it is open",
            config.location()
        )));
    }
    action()
}

/// Reads the committed state of a closed store without opening it.
///
/// # Errors
///
/// Returns `InvalidState` if the store is open, or an I/O error if the log
/// cannot be read.
pub fn read_state(config: &StoreConfiguration) -> CoreResult<StoreState> {
    while_closed(config, "read", || {
        let backend = open_backend(config.location(), config.encryption_key())?;
        let (_, state) = CommitLog::open(backend, false)?;
        Ok(state)
    })
}

/// Rewrites the commit log of a closed store as a single snapshot record.
///
/// Returns the log size before and after.
///
/// # Errors
///
/// Returns `InvalidState` if the store is open, or an I/O error.
pub fn compact(config: &StoreConfiguration) -> CoreResult<(u64, u64)> {
    while_closed(config, "compact", || compact_closed(config))
}

fn compact_closed(config: &StoreConfiguration) -> CoreResult<(u64, u64)> {
    let backend = open_backend(config.location(), config.encryption_key())?;
    let before = backend.size()?;
    let (mut log, state) = CommitLog::open(backend, true)?;
    let record = LogRecord::snapshot(&state);

    match config.location() {
        StoreLocation::File(path) => {
            // Encode through the same backend stack into memory, then swap
            // the file atomically.
            drop(log);
            let image = InMemoryBackend::new();
            {
                let mut staged =
                    open_backend_over(image.clone(), config.encryption_key())?;
                staged.append(&record.encode()?)?;
                staged.flush()?;
            }
            let bytes = image.data();
            let mut file = FileBackend::open(path)?;
            file.replace_contents(&bytes)?;
        }
        StoreLocation::Memory { .. } => log.rewrite(&record)?,
    }

    let after = open_backend(config.location(), config.encryption_key())?.size()?;
    debug!(location = %config.location(), before, after, "compacted store");
    Ok((before, after))
}

fn open_backend_over(
    image: InMemoryBackend,
    key: Option<&EncryptionKey>,
) -> CoreResult<Box<dyn StorageBackend>> {
    match key {
        Some(key) => Ok(Box::new(EncryptedBackend::new(Box::new(image), key.clone())?)),
        None => Ok(Box::new(image)),
    }
}

/// Deletes the files of a closed store.
///
/// Returns true if anything was removed.
///
/// # Errors
///
/// Returns `InvalidState` if the store is open, or an I/O error.
pub fn delete(config: &StoreConfiguration) -> CoreResult<bool> {
    while_closed(config, "delete", || delete_closed(config))
}

fn delete_closed(config: &StoreConfiguration) -> CoreResult<bool> {
    match config.location() {
        StoreLocation::File(path) => {
            let leftover = path.with_extension("compact");
            FileBackend::remove(&leftover)?;
            Ok(FileBackend::remove(path)?)
        }
        StoreLocation::Memory { backend, .. } => match backend {
            Some(buffer) if !buffer.data().is_empty() => {
                let mut buffer = buffer.clone();
                buffer.truncate(0)?;
                Ok(true)
            }
            _ => Ok(false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{ColumnSpec, ColumnType, TableSpec};
    use crate::schema::{ObjectSchema, StaticSchemaMediator};

    fn config(name: &str, buffer: &InMemoryBackend) -> StoreConfiguration {
        StoreConfiguration::builder()
            .in_memory_backend(name, buffer.clone())
            .mediator(StaticSchemaMediator::new(vec![ObjectSchema::builder("A").build().unwrap()]).unwrap())
            .build()
            .unwrap()
    }

    fn create_table(name: &str) -> Op {
        Op::CreateTable(TableSpec {
            name: name.into(),
            columns: vec![ColumnSpec {
                name: "n".into(),
                column_type: ColumnType::Integer,
                nullable: false,
            }],
            primary_key: None,
        })
    }

    fn commit(store: &SharedStore, op: Op) -> Arc<StoreState> {
        let _guard = store.lock_writer();
        let mut working = StoreState::clone(&store.latest());
        working.apply(&op).unwrap();
        store.publish(working, vec![op]).unwrap()
    }

    #[test]
    fn same_location_shares_store() {
        let buffer = InMemoryBackend::new();
        let cfg = config("store-share", &buffer);
        let a = SharedStore::open(&cfg).unwrap();
        let b = SharedStore::open(&cfg).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(is_open(cfg.location()));
        drop((a, b));
        assert!(!is_open(cfg.location()));
    }

    #[test]
    fn different_configuration_is_rejected() {
        let buffer = InMemoryBackend::new();
        let a = config("store-conflict", &buffer);
        let other = config("store-conflict", &InMemoryBackend::new());
        let _store = SharedStore::open(&a).unwrap();
        let err = SharedStore::open(&other).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn commits_survive_reopen() {
        let buffer = InMemoryBackend::new();
        let cfg = config("store-reopen", &buffer);
        {
            let store = SharedStore::open(&cfg).unwrap();
            let published = commit(&store, create_table("t"));
            assert_eq!(published.version().as_u64(), 1);
        }
        let store = SharedStore::open(&cfg).unwrap();
        assert_eq!(store.latest().version().as_u64(), 1);
        assert!(store.latest().table("t").is_some());
    }

    #[test]
    fn failed_append_is_commit_failure() {
        let buffer = InMemoryBackend::new();
        let cfg = config("store-fail", &buffer);
        let store = SharedStore::open(&cfg).unwrap();
        buffer.set_fail_writes(true);

        let _guard = store.lock_writer();
        let err = store
            .publish(StoreState::clone(&store.latest()), vec![create_table("t")])
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CommitFailure);
        assert_eq!(store.latest().version().as_u64(), 0);
    }

    #[test]
    fn compact_and_delete_require_closed_store() {
        let buffer = InMemoryBackend::new();
        let cfg = config("store-maintenance", &buffer);
        let store = SharedStore::open(&cfg).unwrap();
        commit(&store, create_table("a"));
        commit(&store, create_table("b"));
        assert!(compact(&cfg).is_err());
        drop(store);

        let (before, after) = compact(&cfg).unwrap();
        assert!(after < before);
        let state = read_state(&cfg).unwrap();
        assert_eq!(state.version().as_u64(), 2);
        assert_eq!(state.table_names().collect::<Vec<_>>(), vec!["a", "b"]);

        assert!(delete(&cfg).unwrap());
        assert!(buffer.data().is_empty());
    }

    #[test]
    fn open_waits_for_maintenance_on_its_location() {
        let buffer = InMemoryBackend::new();
        let cfg = config("store-maintenance-wait", &buffer);
        let opened = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let opener = while_closed(&cfg, "hold", || {
            let cfg = cfg.clone();
            let flag = Arc::clone(&opened);
            let opener = std::thread::spawn(move || {
                let store = SharedStore::open(&cfg).unwrap();
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                drop(store);
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!opened.load(std::sync::atomic::Ordering::SeqCst));
            Ok(opener)
        })
        .unwrap();

        opener.join().unwrap();
        assert!(opened.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn other_locations_open_during_maintenance() {
        let held = config("store-held", &InMemoryBackend::new());
        let other = config("store-free", &InMemoryBackend::new());
        let store = while_closed(&held, "hold", || SharedStore::open(&other)).unwrap();
        assert!(is_open(other.location()));
        assert!(!is_open(held.location()));
        drop(store);
    }

    #[test]
    fn compact_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfiguration::builder()
            .directory(dir.path())
            .encryption_key(&[9; 32])
            .mediator(StaticSchemaMediator::new(vec![]).unwrap())
            .build()
            .unwrap();
        {
            let store = SharedStore::open(&cfg).unwrap();
            commit(&store, create_table("a"));
            commit(&store, Op::SetSchemaVersion(4));
        }
        compact(&cfg).unwrap();
        let state = read_state(&cfg).unwrap();
        assert_eq!(state.schema_version(), Some(4));
        assert!(state.table("a").is_some());
        assert!(delete(&cfg).unwrap());
        assert!(!delete(&cfg).unwrap());
    }
}
