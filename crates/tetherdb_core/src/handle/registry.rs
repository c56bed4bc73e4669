//! Process-wide, thread-keyed cache of open handles.
//!
//! Entries are keyed by `(thread, configuration)`. The map lock guards
//! bookkeeping only: opening sessions, validating schemas and closing
//! sessions all happen outside it.

use super::Handle;
use crate::config::{LocationKey, StoreConfiguration, StoreLocation};
use crate::engine::Session;
use crate::error::{CoreError, CoreResult};
use crate::migration;
use crate::notify::{current_channel, NotificationChannel};
use crate::schema::{table_name_for, ColumnIndices, SchemaMediator};
use crate::transaction::TransactionState;
use crate::types::Version;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

type Listener = Arc<dyn Fn() + Send + Sync>;

/// State shared by every clone of one thread's handle.
pub(crate) struct HandleInner {
    owner: ThreadId,
    config: StoreConfiguration,
    session: Mutex<Session>,
    channel: Option<Arc<dyn NotificationChannel>>,
    columns: ColumnIndices,
    listeners: Mutex<Vec<Listener>>,
    last_seen: AtomicU64,
    state: Mutex<TransactionState>,
    closed: AtomicBool,
}

impl HandleInner {
    fn new(config: StoreConfiguration, session: Session, columns: ColumnIndices) -> Self {
        let version = session.version();
        Self {
            owner: thread::current().id(),
            config,
            session: Mutex::new(session),
            channel: current_channel(),
            columns,
            listeners: Mutex::new(Vec::new()),
            last_seen: AtomicU64::new(version.as_u64()),
            state: Mutex::new(TransactionState::Idle),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &StoreConfiguration {
        &self.config
    }

    pub(crate) fn mediator(&self) -> &dyn SchemaMediator {
        self.config.mediator().as_ref()
    }

    pub(crate) fn columns(&self) -> &ColumnIndices {
        &self.columns
    }

    pub(crate) fn channel(&self) -> Option<&Arc<dyn NotificationChannel>> {
        self.channel.as_ref()
    }

    pub(crate) fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::invalid_state("handle is closed"));
        }
        Ok(())
    }

    pub(crate) fn transaction_state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn set_transaction_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Records `version` as observed. Returns true if it is newer than the
    /// last observed one.
    pub(crate) fn observe(&self, version: Version) -> bool {
        self.last_seen.fetch_max(version.as_u64(), Ordering::AcqRel) < version.as_u64()
    }

    pub(crate) fn add_listener(&self, listener: Listener) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    pub(crate) fn fire_listeners(&self) {
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        for listener in listeners {
            listener();
        }
    }

    /// Handles a change signal on the owning thread.
    pub(crate) fn deliver_change(&self, version: Version) {
        if self.is_closed() || thread::current().id() != self.owner {
            return;
        }
        if self.last_seen.load(Ordering::Acquire) >= version.as_u64() {
            return;
        }
        if self.transaction_state() != TransactionState::Idle {
            // Listeners run when the open transaction commits.
            return;
        }
        let current = {
            let mut session = self.session();
            if let Err(e) = session.refresh() {
                debug!(error = %e, "change signal ignored");
                return;
            }
            session.version()
        };
        if self.observe(current) {
            self.fire_listeners();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        {
            let mut session = self.session();
            if session.is_in_write() {
                warn!(
                    location = %self.config.location(),
                    "closing handle with an open transaction; changes discarded"
                );
            }
            session.close();
        }
        self.set_transaction_state(TransactionState::Idle);
        self.clear_listeners();
    }
}

struct Entry {
    inner: Arc<HandleInner>,
    ref_count: usize,
}

type RegistryKey = (ThreadId, StoreConfiguration);

static HANDLES: Lazy<Mutex<HashMap<RegistryKey, Entry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// The registry of open handles.
///
/// A thread holds at most one live handle per configuration. Acquiring again
/// on the same thread returns the cached handle and bumps its reference
/// count; acquiring on another thread opens an independent session.
pub struct HandleRegistry;

impl HandleRegistry {
    /// Returns the calling thread's handle for `config`, opening it if
    /// needed.
    ///
    /// A fresh open validates the schema, creating missing tables, runs the
    /// migration when the stored schema version is older, and runs the
    /// initial-data transaction when the store was just created.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` on version skew without a migration or when
    /// the stored tables differ from the schema, `Migration` if the
    /// migration fails, `InvalidArgument` if the location is open under a
    /// different configuration, or `IoFailure` if the store cannot be read.
    pub fn acquire(config: &StoreConfiguration) -> CoreResult<Handle> {
        let key = (thread::current().id(), config.clone());
        if let Some(entry) = HANDLES.lock().get_mut(&key) {
            entry.ref_count += 1;
            return Ok(Handle::from_inner(Arc::clone(&entry.inner)));
        }

        let mut session = Session::open(config)?;
        let (columns, created) = match initialize(&mut session, config) {
            Ok(result) => result,
            Err(e) => {
                if session.is_in_write() {
                    let _ = session.cancel();
                }
                return Err(e);
            }
        };
        let inner = Arc::new(HandleInner::new(config.clone(), session, columns));
        HANDLES.lock().insert(
            key,
            Entry {
                inner: Arc::clone(&inner),
                ref_count: 1,
            },
        );
        debug!(location = %config.location(), created, "handle opened");

        let handle = Handle::from_inner(inner);
        if created {
            // The schema write is still open; initial data joins it.
            handle.inner.set_transaction_state(TransactionState::Active);
            let seeded = match config.initial_data() {
                Some(initial_data) => initial_data(&handle),
                None => Ok(()),
            };
            match seeded {
                Ok(()) => handle.commit_transaction()?,
                Err(e) => {
                    let _ = handle.cancel_transaction();
                    return Err(e);
                }
            }
        }
        Ok(handle)
    }

    /// Releases one reference to `handle`. The session closes when the last
    /// reference is released.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if this handle value was already released.
    pub fn release(handle: &Handle) -> CoreResult<()> {
        if handle.released.replace(true) {
            return Err(CoreError::invalid_state("handle was already released"));
        }
        let inner = &handle.inner;
        let key = (inner.owner, inner.config.clone());
        let last = {
            let mut handles = HANDLES.lock();
            match handles.get_mut(&key) {
                Some(entry) if Arc::ptr_eq(&entry.inner, inner) => {
                    entry.ref_count -= 1;
                    if entry.ref_count == 0 {
                        handles.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                _ => return Err(CoreError::invalid_state("handle is not registered")),
            }
        };
        if last {
            inner.close();
            debug!(location = %inner.config.location(), "handle closed");
        }
        Ok(())
    }

    /// Reference count of the calling thread's handle for `config`.
    #[must_use]
    pub fn ref_count(config: &StoreConfiguration) -> usize {
        HANDLES
            .lock()
            .get(&(thread::current().id(), config.clone()))
            .map_or(0, |entry| entry.ref_count)
    }

    /// Number of threads holding a handle on `location`.
    #[must_use]
    pub fn open_handles(location: &StoreLocation) -> usize {
        let key = location.key();
        HANDLES
            .lock()
            .keys()
            .filter(|(_, config)| config.location().key() == key)
            .count()
    }
}

/// Posts a change signal for `version` to every handle on `location` owned
/// by a thread other than `origin`.
pub(crate) fn broadcast_change(location: &LocationKey, version: Version, origin: ThreadId) {
    let targets: Vec<Arc<HandleInner>> = HANDLES
        .lock()
        .iter()
        .filter(|((thread, config), entry)| {
            *thread != origin && config.location().key() == *location && entry.inner.channel.is_some()
        })
        .map(|(_, entry)| Arc::clone(&entry.inner))
        .collect();

    for inner in targets {
        let Some(channel) = inner.channel.clone() else {
            continue;
        };
        let target = Arc::clone(&inner);
        if !channel.post(Box::new(move || target.deliver_change(version))) {
            debug!(%version, "change signal dropped; channel is dead");
        }
    }
}

/// Delivers a change signal for `version` to the calling thread's handles on
/// `location`.
pub(crate) fn refresh_thread_handles(location: &LocationKey, version: Version) {
    let me = thread::current().id();
    let targets: Vec<Arc<HandleInner>> = HANDLES
        .lock()
        .iter()
        .filter(|((thread, config), _)| *thread == me && config.location().key() == *location)
        .map(|(_, entry)| Arc::clone(&entry.inner))
        .collect();
    for inner in targets {
        inner.deliver_change(version);
    }
}

/// Brings a freshly opened session up to the configured schema.
///
/// Returns the validated column indices and whether the store was stamped
/// for the first time. A first stamp leaves the write transaction open.
fn initialize(session: &mut Session, config: &StoreConfiguration) -> CoreResult<(ColumnIndices, bool)> {
    migrate(session, config)?;

    let mediator = config.mediator().as_ref();
    let classes = mediator.model_classes();
    let complete = session.schema_version().is_some()
        && classes
            .iter()
            .all(|class| session.state().table(&table_name_for(class)).is_some());
    if complete {
        return Ok((validate_all(session, mediator, &classes)?, false));
    }

    session.begin_write()?;
    let columns = validate_all(session, mediator, &classes)?;
    let created = session.schema_version().is_none();
    if created {
        session.set_schema_version(config.schema_version())?;
    } else {
        session.commit()?;
    }
    Ok((columns, created))
}

fn validate_all(
    session: &mut Session,
    mediator: &dyn SchemaMediator,
    classes: &[String],
) -> CoreResult<ColumnIndices> {
    let mut columns = ColumnIndices::default();
    for class in classes {
        columns.insert(mediator.validate_or_create_schema(class, session)?);
    }
    Ok(columns)
}

/// Runs the configured migration if the stored schema version is older.
///
/// Returns true if a migration ran.
pub(crate) fn migrate(session: &mut Session, config: &StoreConfiguration) -> CoreResult<bool> {
    let target = config.schema_version();
    let Some(stored) = session.schema_version() else {
        return Ok(false);
    };
    if stored > target {
        return Err(CoreError::schema_mismatch(
            session.location_name(),
            format!("stored schema version {stored} is newer than the configured {target}"),
        ));
    }
    if stored == target {
        return Ok(false);
    }
    let Some(migration) = config.migration() else {
        return Err(CoreError::schema_mismatch(
            session.location_name(),
            format!("migration required from schema version {stored} to {target}"),
        ));
    };

    session.begin_write()?;
    // Another thread may have migrated while this one waited for the lock.
    match session.schema_version() {
        Some(current) if current < target => {
            if let Err(e) = migration::run(
                migration.as_ref(),
                session,
                config.mediator().as_ref(),
                current,
                target,
            ) {
                let _ = session.cancel();
                return Err(e);
            }
            session.commit()?;
            debug!(location = %config.location(), from = current, to = target, "store migrated");
            Ok(true)
        }
        _ => {
            session.cancel()?;
            Ok(false)
        }
    }
}
