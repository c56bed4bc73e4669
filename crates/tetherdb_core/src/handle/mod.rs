//! Thread-confined store handles.
//!
//! A [`Handle`] is a live connection to a store owned by exactly one thread.
//! Handles are obtained from the [`HandleRegistry`], which caches one per
//! thread and configuration and reference-counts it; dropping or
//! [closing](Handle::close) a handle releases one reference.
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = Handle::open(&config)?;
//! handle.execute_transaction(|h| {
//!     let person = h.create_object_with_primary_key("Person", 1)?;
//!     person.set("name", "Ada")
//! })?;
//! assert_eq!(handle.count("Person")?, 1);
//! ```

mod registry;

pub use registry::HandleRegistry;

pub(crate) use registry::{broadcast_change, migrate, refresh_thread_handles, HandleInner};

use crate::config::{self, StoreConfiguration};
use crate::error::{CoreError, CoreResult};
use crate::object::{ManagedObject, ObjectKind};
use crate::transaction::{AsyncTransaction, CancellableTask, TransactionRunner, TransactionState};
use crate::types::{PrimaryKey, RowId, Version};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

/// A thread's connection to one store.
///
/// `Handle` is neither `Send` nor `Sync`. Open a separate handle on every
/// thread that needs the store.
pub struct Handle {
    pub(crate) inner: Arc<HandleInner>,
    released: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

impl Handle {
    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self {
            inner,
            released: Cell::new(false),
            _not_send: PhantomData,
        }
    }

    /// Opens the calling thread's handle for `config`.
    ///
    /// # Errors
    ///
    /// See [`HandleRegistry::acquire`].
    pub fn open(config: &StoreConfiguration) -> CoreResult<Self> {
        HandleRegistry::acquire(config)
    }

    /// Opens a handle on the process-wide default configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no default configuration is set.
    pub fn open_default() -> CoreResult<Self> {
        let config = config::default_configuration()
            .ok_or_else(|| CoreError::invalid_state("no default configuration has been set"))?;
        Self::open(&config)
    }

    /// Releases this reference to the handle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the handle was already released.
    pub fn close(self) -> CoreResult<()> {
        HandleRegistry::release(&self)
    }

    /// Configuration the handle was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfiguration {
        self.inner.config()
    }

    /// Returns true once the last reference has been released.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Version of the snapshot this handle reads.
    #[must_use]
    pub fn version(&self) -> Version {
        self.inner.session().version()
    }

    /// Stamped schema version of the store.
    #[must_use]
    pub fn schema_version(&self) -> Option<u64> {
        self.inner.session().schema_version()
    }

    /// Returns true while a transaction is active.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.inner.transaction_state() != TransactionState::Idle
    }

    /// Current transaction state.
    #[must_use]
    pub fn transaction_state(&self) -> TransactionState {
        self.inner.transaction_state()
    }

    /// Starts a write transaction, blocking while another thread writes to
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a transaction is already active or the
    /// handle is closed.
    pub fn begin_transaction(&self) -> CoreResult<()> {
        self.inner.check_open()?;
        if self.is_in_transaction() {
            return Err(CoreError::invalid_state(
                "a transaction is already active on this handle; nested transactions are not supported",
            ));
        }
        self.inner.session().begin_write()?;
        self.inner.set_transaction_state(TransactionState::Active);
        Ok(())
    }

    /// Commits the active transaction and notifies other threads.
    ///
    /// On failure the transaction is rolled back.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without an active transaction, or
    /// `CommitFailure` if the store rejects the commit.
    pub fn commit_transaction(&self) -> CoreResult<()> {
        self.inner.check_open()?;
        if self.inner.transaction_state() != TransactionState::Active {
            return Err(CoreError::invalid_state("no transaction is active"));
        }
        self.inner.set_transaction_state(TransactionState::Committing);
        let result = self.inner.session().commit();
        self.inner.set_transaction_state(TransactionState::Idle);
        let version = result?;

        if self.inner.observe(version) {
            let location = self.inner.config().location().key();
            broadcast_change(&location, version, thread::current().id());
            self.inner.fire_listeners();
        }
        Ok(())
    }

    /// Rolls back the active transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without an active transaction.
    pub fn cancel_transaction(&self) -> CoreResult<()> {
        self.inner.check_open()?;
        if self.inner.transaction_state() != TransactionState::Active {
            return Err(CoreError::invalid_state("no transaction is active"));
        }
        self.inner.set_transaction_state(TransactionState::Cancelling);
        let result = self.inner.session().cancel();
        self.inner.set_transaction_state(TransactionState::Idle);
        result
    }

    /// Moves to the latest committed version, running change listeners if
    /// it changed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` inside a transaction or on a closed handle.
    pub fn refresh(&self) -> CoreResult<bool> {
        self.inner.check_open()?;
        let (changed, version) = {
            let mut session = self.inner.session();
            (session.refresh()?, session.version())
        };
        if self.inner.observe(version) {
            self.inner.fire_listeners();
        }
        Ok(changed)
    }

    /// Registers a listener run on this thread after every change to the
    /// store, local or remote.
    ///
    /// Remote changes are delivered through the notification channel the
    /// thread had when the handle was opened.
    pub fn add_change_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.add_listener(Arc::new(listener));
    }

    /// Removes every change listener.
    pub fn remove_all_change_listeners(&self) {
        self.inner.clear_listeners();
    }

    /// Creates an object of a class without a primary key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a transaction, or `InvalidArgument`
    /// for an unknown class or one with a primary key.
    pub fn create_object(&self, class_name: &str) -> CoreResult<ManagedObject> {
        self.inner.check_open()?;
        let info = self.inner.columns().require(class_name)?;
        if info.primary_key_index().is_some() {
            return Err(CoreError::invalid_argument(format!(
                "{class_name} has a primary key; use create_object_with_primary_key"
            )));
        }
        let row = self.inner.session().add_empty_row(info.table_name())?;
        Ok(self.managed(class_name, row, ObjectKind::Typed))
    }

    /// Creates an object with its primary key set.
    ///
    /// # Errors
    ///
    /// Returns `PrimaryKeyConstraintViolation` if the key is taken,
    /// `InvalidState` outside a transaction, or `InvalidArgument` for an
    /// unknown class, one without a primary key, or a key of the wrong type.
    pub fn create_object_with_primary_key(
        &self,
        class_name: &str,
        key: impl Into<PrimaryKey>,
    ) -> CoreResult<ManagedObject> {
        self.inner.check_open()?;
        let info = self.inner.columns().require(class_name)?;
        if info.primary_key_index().is_none() {
            return Err(CoreError::invalid_argument(format!(
                "{class_name} has no primary key"
            )));
        }
        let key = key.into();
        let row = self
            .inner
            .session()
            .add_empty_row_with_key(info.table_name(), key.clone())
            .map_err(|e| match e {
                CoreError::PrimaryKeyConstraintViolation { .. } => {
                    CoreError::primary_key_violation(class_name, &key)
                }
                other => other,
            })?;
        Ok(self.managed(class_name, row, ObjectKind::Typed))
    }

    /// Finds an object by primary key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown class or one without a
    /// primary key.
    pub fn find(
        &self,
        class_name: &str,
        key: impl Into<PrimaryKey>,
    ) -> CoreResult<Option<ManagedObject>> {
        self.inner.check_open()?;
        let info = self.inner.columns().require(class_name)?;
        if info.primary_key_index().is_none() {
            return Err(CoreError::invalid_argument(format!(
                "{class_name} has no primary key"
            )));
        }
        let row = self
            .inner
            .session()
            .find_by_primary_key(info.table_name(), &key.into())?;
        Ok(row.map(|row| self.managed(class_name, row, ObjectKind::Typed)))
    }

    /// Every object of a class, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown class.
    pub fn all(&self, class_name: &str) -> CoreResult<Vec<ManagedObject>> {
        self.inner.check_open()?;
        let info = self.inner.columns().require(class_name)?;
        let rows: Vec<RowId> = self
            .inner
            .session()
            .state()
            .require_table(info.table_name())?
            .row_ids()
            .collect();
        Ok(rows
            .into_iter()
            .map(|row| self.managed(class_name, row, ObjectKind::Typed))
            .collect())
    }

    /// Number of objects of a class.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown class.
    pub fn count(&self, class_name: &str) -> CoreResult<usize> {
        self.inner.check_open()?;
        let info = self.inner.columns().require(class_name)?;
        Ok(self
            .inner
            .session()
            .state()
            .require_table(info.table_name())?
            .len())
    }

    /// Deletes every object of a class.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a transaction, or `InvalidArgument`
    /// for an unknown class.
    pub fn delete_all(&self, class_name: &str) -> CoreResult<()> {
        self.inner.check_open()?;
        let info = self.inner.columns().require(class_name)?;
        self.inner.session().clear_table(info.table_name())
    }

    /// A reflective view of one row. Dynamic objects can be read and
    /// written but not copied out of the store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown class or a missing row.
    pub fn dynamic_object(&self, class_name: &str, row: RowId) -> CoreResult<ManagedObject> {
        self.inner.check_open()?;
        let info = self.inner.columns().require(class_name)?;
        if !self
            .inner
            .session()
            .state()
            .require_table(info.table_name())?
            .contains(row)
        {
            return Err(CoreError::invalid_argument(format!(
                "{class_name} has no object at {row}"
            )));
        }
        Ok(self.managed(class_name, row, ObjectKind::Dynamic))
    }

    /// Runs `mutation` in a write transaction on this handle.
    ///
    /// # Errors
    ///
    /// See [`TransactionRunner::run`].
    pub fn execute_transaction<T, F>(&self, mutation: F) -> CoreResult<T>
    where
        F: FnOnce(&Self) -> CoreResult<T>,
    {
        TransactionRunner::run(self, mutation)
    }

    /// Prepares `mutation` to run on a worker thread against this handle's
    /// store. Outcomes are delivered through the channel this handle was
    /// opened with.
    pub fn async_transaction<F>(&self, mutation: F) -> AsyncTransaction
    where
        F: FnOnce(&Self) -> CoreResult<()> + Send + 'static,
    {
        AsyncTransaction::new(self.config(), mutation).channel(self.inner.channel().cloned())
    }

    /// Runs `mutation` on the process-wide worker pool without callbacks.
    /// A failure is rethrown on this thread when its event loop runs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the handle is closed or the pool cannot be
    /// started.
    pub fn execute_transaction_async<F>(&self, mutation: F) -> CoreResult<CancellableTask>
    where
        F: FnOnce(&Self) -> CoreResult<()> + Send + 'static,
    {
        self.inner.check_open()?;
        self.async_transaction(mutation).submit()
    }

    pub(crate) fn managed(&self, class_name: &str, row: RowId, kind: ObjectKind) -> ManagedObject {
        ManagedObject::new(Arc::clone(&self.inner), class_name, row, kind)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.released.get() {
            if let Err(e) = HandleRegistry::release(self) {
                tracing::debug!(error = %e, "handle release on drop failed");
            }
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("location", self.inner.config().location())
            .field("closed", &self.inner.is_closed())
            .field("state", &self.inner.transaction_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectSchema, PropertyType, StaticSchemaMediator};
    use crate::{ErrorKind, Value};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tetherdb_storage::InMemoryBackend;

    fn mediator() -> StaticSchemaMediator {
        StaticSchemaMediator::new(vec![
            ObjectSchema::builder("Person")
                .property("id", PropertyType::Integer)
                .property("name", PropertyType::Text)
                .primary_key("id")
                .build()
                .unwrap(),
            ObjectSchema::builder("Note")
                .property("text", PropertyType::Text)
                .build()
                .unwrap(),
        ])
        .unwrap()
    }

    fn config(name: &str) -> StoreConfiguration {
        StoreConfiguration::builder()
            .in_memory_backend(name, InMemoryBackend::new())
            .schema_version(1)
            .mediator(mediator())
            .build()
            .unwrap()
    }

    #[test]
    fn same_thread_shares_handle() {
        let cfg = config("handle-shared");
        let a = Handle::open(&cfg).unwrap();
        let b = Handle::open(&cfg).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(HandleRegistry::ref_count(&cfg), 2);

        a.close().unwrap();
        assert!(!b.is_closed());
        assert_eq!(HandleRegistry::ref_count(&cfg), 1);
        drop(b);
        assert_eq!(HandleRegistry::ref_count(&cfg), 0);
    }

    #[test]
    fn release_to_zero_then_reopen_is_fresh() {
        let cfg = config("handle-reopen");
        let a = Handle::open(&cfg).unwrap();
        let first = Arc::clone(&a.inner);
        a.close().unwrap();
        assert!(first.is_closed());

        let b = Handle::open(&cfg).unwrap();
        assert!(!Arc::ptr_eq(&first, &b.inner));
        assert_eq!(b.schema_version(), Some(1));
    }

    #[test]
    fn double_release_is_invalid_state() {
        let cfg = config("handle-double-release");
        let handle = Handle::open(&cfg).unwrap();
        HandleRegistry::release(&handle).unwrap();
        let err = HandleRegistry::release(&handle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn nested_begin_is_rejected() {
        let cfg = config("handle-nested");
        let handle = Handle::open(&cfg).unwrap();
        handle.begin_transaction().unwrap();
        let err = handle.begin_transaction().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        handle.cancel_transaction().unwrap();
        assert!(handle.commit_transaction().is_err());
    }

    #[test]
    fn objects_round_trip_through_transactions() {
        let cfg = config("handle-objects");
        let handle = Handle::open(&cfg).unwrap();
        assert_eq!(
            handle.create_object("Note").unwrap_err().kind(),
            ErrorKind::InvalidState
        );

        handle.begin_transaction().unwrap();
        let person = handle.create_object_with_primary_key("Person", 1).unwrap();
        person.set("name", "Ada").unwrap();
        handle.create_object("Note").unwrap();
        let err = handle.create_object_with_primary_key("Person", 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrimaryKeyConstraintViolation);
        assert!(err.to_string().contains("Person"));
        handle.commit_transaction().unwrap();

        let found = handle.find("Person", 1).unwrap().unwrap();
        assert_eq!(found.get("name").unwrap(), Value::from("Ada"));
        assert!(handle.find("Person", 2).unwrap().is_none());
        assert_eq!(handle.count("Note").unwrap(), 1);
        assert_eq!(handle.all("Person").unwrap().len(), 1);

        handle.begin_transaction().unwrap();
        handle.delete_all("Person").unwrap();
        handle.commit_transaction().unwrap();
        assert_eq!(handle.count("Person").unwrap(), 0);
        assert!(!found.is_valid());
    }

    #[test]
    fn wrong_class_shapes_are_rejected() {
        let cfg = config("handle-shapes");
        let handle = Handle::open(&cfg).unwrap();
        handle.begin_transaction().unwrap();
        assert_eq!(
            handle.create_object("Person").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            handle
                .create_object_with_primary_key("Note", 1)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            handle.create_object("Missing").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        handle.cancel_transaction().unwrap();
    }

    #[test]
    fn local_commit_runs_listeners() {
        let cfg = config("handle-listeners");
        let handle = Handle::open(&cfg).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        handle.add_change_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.begin_transaction().unwrap();
        handle.create_object("Note").unwrap();
        handle.commit_transaction().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.begin_transaction().unwrap();
        handle.commit_transaction().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.remove_all_change_listeners();
        handle.begin_transaction().unwrap();
        handle.create_object("Note").unwrap();
        handle.commit_transaction().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schema_version_skew_without_migration() {
        let buffer = InMemoryBackend::new();
        let v2 = StoreConfiguration::builder()
            .in_memory_backend("handle-skew", buffer.clone())
            .schema_version(2)
            .mediator(mediator())
            .build()
            .unwrap();
        Handle::open(&v2).unwrap().close().unwrap();

        let v1 = StoreConfiguration::builder()
            .in_memory_backend("handle-skew", buffer.clone())
            .schema_version(1)
            .mediator(mediator())
            .build()
            .unwrap();
        let err = Handle::open(&v1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);

        let v3 = StoreConfiguration::builder()
            .in_memory_backend("handle-skew", buffer)
            .schema_version(3)
            .mediator(mediator())
            .build()
            .unwrap();
        let err = Handle::open(&v3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn initial_data_runs_once() {
        let buffer = InMemoryBackend::new();
        let runs = Arc::new(Mutex::new(0));
        let runs2 = Arc::clone(&runs);
        let cfg = StoreConfiguration::builder()
            .in_memory_backend("handle-initial", buffer)
            .schema_version(1)
            .mediator(mediator())
            .initial_data(move |h| {
                *runs2.lock() += 1;
                h.create_object_with_primary_key("Person", 7)?.set("name", "seed")
            })
            .build()
            .unwrap();

        let handle = Handle::open(&cfg).unwrap();
        assert_eq!(handle.count("Person").unwrap(), 1);
        handle.close().unwrap();
        let handle = Handle::open(&cfg).unwrap();
        assert_eq!(handle.count("Person").unwrap(), 1);
        assert_eq!(*runs.lock(), 1);
    }

    #[test]
    fn failing_initial_data_leaves_store_unstamped() {
        let buffer = InMemoryBackend::new();
        let cfg = StoreConfiguration::builder()
            .in_memory_backend("handle-initial-failure", buffer)
            .schema_version(1)
            .mediator(mediator())
            .initial_data(|_| Err(CoreError::transaction_aborted("no seed")))
            .build()
            .unwrap();
        let err = Handle::open(&cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert_eq!(HandleRegistry::ref_count(&cfg), 0);
    }

    #[test]
    fn closed_handle_objects_are_invalid() {
        let cfg = config("handle-closed-objects");
        let handle = Handle::open(&cfg).unwrap();
        handle.begin_transaction().unwrap();
        let note = handle.create_object("Note").unwrap();
        handle.commit_transaction().unwrap();
        assert!(note.is_valid());
        handle.close().unwrap();
        assert!(!note.is_valid());
        assert_eq!(note.get("text").unwrap_err().kind(), ErrorKind::InvalidState);
    }
}
