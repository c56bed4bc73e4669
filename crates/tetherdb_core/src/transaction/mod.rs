//! Write transactions.
//!
//! [`TransactionRunner`] brackets a mutation with begin and commit, rolling
//! back when the mutation fails or panics. [`AsyncTransactionPipeline`] runs
//! the same bracket on a worker pool and reports the outcome back to the
//! submitting thread through its notification channel.

mod pipeline;
mod runner;

pub use pipeline::{AsyncTransaction, AsyncTransactionPipeline, CancellableTask, TaskState};
pub use runner::TransactionRunner;

/// Transaction state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// No transaction.
    Idle,
    /// A write transaction is open.
    Active,
    /// The open transaction is being committed.
    Committing,
    /// The open transaction is being rolled back.
    Cancelling,
}
