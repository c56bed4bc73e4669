use crate::error::CoreResult;
use crate::handle::Handle;
use tracing::warn;

/// Runs mutations inside a write transaction.
pub struct TransactionRunner;

impl TransactionRunner {
    /// Begins a transaction on `handle`, runs `mutation`, and commits.
    ///
    /// If `mutation` fails, the transaction is rolled back before the error
    /// is returned. If it panics, the transaction is rolled back while the
    /// panic unwinds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a transaction is already active, the
    /// mutation's own error, or `CommitFailure` if the commit is rejected
    /// (the transaction is then rolled back).
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// TransactionRunner::run(&handle, |h| {
    ///     h.create_object("Note")?.set("text", "hello")
    /// })?;
    /// ```
    pub fn run<T, F>(handle: &Handle, mutation: F) -> CoreResult<T>
    where
        F: FnOnce(&Handle) -> CoreResult<T>,
    {
        handle.begin_transaction()?;
        let mut guard = RollbackOnUnwind {
            handle,
            armed: true,
        };
        let result = mutation(handle);
        guard.armed = false;

        match result {
            Ok(value) => {
                handle.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                cancel_best_effort(handle);
                Err(e)
            }
        }
    }
}

fn cancel_best_effort(handle: &Handle) {
    if handle.is_closed() || !handle.is_in_transaction() {
        warn!("could not cancel transaction, not currently in a transaction");
        return;
    }
    if let Err(e) = handle.cancel_transaction() {
        warn!(error = %e, "could not cancel transaction");
    }
}

struct RollbackOnUnwind<'a> {
    handle: &'a Handle,
    armed: bool,
}

impl Drop for RollbackOnUnwind<'_> {
    fn drop(&mut self) {
        if self.armed && !self.handle.is_closed() && self.handle.is_in_transaction() {
            let _ = self.handle.cancel_transaction();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::schema::{ObjectSchema, PropertyType, StaticSchemaMediator};
    use crate::{ErrorKind, StoreConfiguration, Value};
    use std::panic::{self, AssertUnwindSafe};
    use tetherdb_storage::InMemoryBackend;

    fn open(name: &str, buffer: &InMemoryBackend) -> Handle {
        let mediator = StaticSchemaMediator::new(vec![ObjectSchema::builder("Note")
            .property("text", PropertyType::Text)
            .build()
            .unwrap()])
        .unwrap();
        let config = StoreConfiguration::builder()
            .in_memory_backend(name, buffer.clone())
            .mediator(mediator)
            .build()
            .unwrap();
        Handle::open(&config).unwrap()
    }

    #[test]
    fn commits_on_success() {
        let handle = open("runner-commit", &InMemoryBackend::new());
        let row = TransactionRunner::run(&handle, |h| {
            let note = h.create_object("Note")?;
            note.set("text", "kept")?;
            Ok(note.row_id())
        })
        .unwrap();
        assert!(!handle.is_in_transaction());
        let note = handle.dynamic_object("Note", row).unwrap();
        assert_eq!(note.get("text").unwrap(), Value::from("kept"));
    }

    #[test]
    fn rolls_back_on_error() {
        let handle = open("runner-rollback", &InMemoryBackend::new());
        let err = TransactionRunner::run(&handle, |h| {
            h.create_object("Note")?.set("text", "lost")?;
            Err::<(), _>(CoreError::transaction_aborted("changed my mind"))
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert!(!handle.is_in_transaction());
        assert_eq!(handle.count("Note").unwrap(), 0);
    }

    #[test]
    fn rolls_back_on_panic() {
        let handle = open("runner-panic", &InMemoryBackend::new());
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            TransactionRunner::run(&handle, |h| -> CoreResult<()> {
                h.create_object("Note")?;
                panic!("mutation panicked");
            })
        }));
        assert!(result.is_err());
        assert!(!handle.is_in_transaction());
        assert_eq!(handle.count("Note").unwrap(), 0);
    }

    #[test]
    fn nested_run_is_rejected() {
        let handle = open("runner-nested", &InMemoryBackend::new());
        let err = TransactionRunner::run(&handle, |h| TransactionRunner::run(h, |_| Ok(()))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(!handle.is_in_transaction());
    }

    #[test]
    fn mutation_that_closes_its_transaction_is_tolerated() {
        let handle = open("runner-self-cancel", &InMemoryBackend::new());
        let err = TransactionRunner::run(&handle, |h| {
            h.cancel_transaction()?;
            Err::<(), _>(CoreError::transaction_aborted("after cancel"))
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    }

    #[test]
    fn commit_failure_rolls_back_and_surfaces() {
        let buffer = InMemoryBackend::new();
        let handle = open("runner-commit-failure", &buffer);
        buffer.set_fail_writes(true);
        let err = TransactionRunner::run(&handle, |h| h.create_object("Note").map(drop)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommitFailure);
        assert!(!handle.is_in_transaction());
        buffer.set_fail_writes(false);
        assert_eq!(handle.count("Note").unwrap(), 0);
    }
}
