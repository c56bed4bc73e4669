//! Asynchronous transactions on a worker pool.
//!
//! Each submission runs on a rayon worker with its own handle, never the
//! submitting thread's. The outcome travels back as a job posted to the
//! submitting thread's [`NotificationChannel`]:
//!
//! ```text
//! Scheduled -> Running -> CommittedPending -> Delivered | Dropped
//!                      -> RolledBack       -> Delivered | Dropped
//! ```
//!
//! A commit broadcasts its change signal before the success job is posted,
//! so listeners on the submitting thread run before `on_success`.
//!
//! A failure without an error callback is rethrown as a panic on the
//! submitting thread, through its channel. A failure that cannot reach that
//! thread at all, because the channel died or the task was cancelled while
//! running, is escalated as a panic on the worker instead. The pool's panic
//! handler logs it and counts it in
//! [`AsyncTransactionPipeline::escalated_failures`].

use super::TransactionRunner;
use crate::config::StoreConfiguration;
use crate::error::{CoreError, CoreResult};
use crate::handle::{refresh_thread_handles, Handle};
use crate::notify::{current_channel, NotificationChannel};
use crate::types::Version;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

type Mutation = Box<dyn FnOnce(&Handle) -> CoreResult<()> + Send>;
type SuccessCallback = Box<dyn FnOnce() + Send>;
type ErrorCallback = Box<dyn FnOnce(CoreError) + Send>;

/// Where a submission is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for a worker.
    Scheduled,
    /// The mutation is running.
    Running,
    /// Committed; the outcome has not been handed to the channel yet.
    CommittedPending,
    /// Rolled back; the outcome has not been handed to the channel yet.
    RolledBack,
    /// The outcome was posted to the submitting thread.
    Delivered,
    /// The outcome was discarded: cancelled, no callback, or dead channel.
    Dropped,
}

impl TaskState {
    /// Returns true for `Delivered` and `Dropped`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Dropped)
    }
}

struct TaskInner {
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
    finished: Condvar,
}

impl TaskInner {
    fn set(&self, state: TaskState) {
        *self.state.lock() = state;
        if state.is_terminal() {
            self.finished.notify_all();
        }
    }
}

/// Handle to a submitted asynchronous transaction.
///
/// Cancelling is cooperative: before the worker starts, the submission is
/// skipped; afterwards the mutation still commits or rolls back, and only
/// the delivery of its outcome is suppressed.
#[derive(Clone)]
pub struct CancellableTask {
    inner: Arc<TaskInner>,
}

impl CancellableTask {
    fn new() -> Self {
        Self {
            inner: Arc::new(TaskInner {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(TaskState::Scheduled),
                finished: Condvar::new(),
            }),
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.inner.state.lock()
    }

    /// Returns true once the state is terminal.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Blocks until the task reaches a terminal state or `timeout` elapses.
    /// Returns true if it finished.
    ///
    /// A terminal state means the outcome was posted, not that the
    /// submitting thread has run it yet.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.is_terminal() {
            if self.inner.finished.wait_until(&mut state, deadline).timed_out() {
                return state.is_terminal();
            }
        }
        true
    }
}

impl fmt::Debug for CancellableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableTask")
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// An asynchronous transaction waiting to be submitted.
///
/// Built from [`AsyncTransaction::new`] or [`Handle::async_transaction`].
/// The delivery channel defaults to the calling thread's current channel.
#[must_use]
pub struct AsyncTransaction {
    config: StoreConfiguration,
    mutation: Mutation,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    channel: Option<Arc<dyn NotificationChannel>>,
}

impl AsyncTransaction {
    /// Prepares `mutation` for the store `config` names.
    pub fn new<F>(config: &StoreConfiguration, mutation: F) -> Self
    where
        F: FnOnce(&Handle) -> CoreResult<()> + Send + 'static,
    {
        Self {
            config: config.clone(),
            mutation: Box::new(mutation),
            on_success: None,
            on_error: None,
            channel: current_channel(),
        }
    }

    /// Runs `callback` on the submitting thread after a commit.
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Runs `callback` on the submitting thread after a failure.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(CoreError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Delivers outcomes through `channel` instead of the current one.
    pub fn channel(mut self, channel: Option<Arc<dyn NotificationChannel>>) -> Self {
        self.channel = channel;
        self
    }

    /// Submits to the process-wide pipeline.
    ///
    /// # Errors
    ///
    /// See [`AsyncTransactionPipeline::submit`].
    pub fn submit(self) -> CoreResult<CancellableTask> {
        AsyncTransactionPipeline::global()?.submit(self)
    }

    /// Submits to `pipeline`.
    ///
    /// # Errors
    ///
    /// See [`AsyncTransactionPipeline::submit`].
    pub fn submit_to(self, pipeline: &AsyncTransactionPipeline) -> CoreResult<CancellableTask> {
        pipeline.submit(self)
    }
}

impl fmt::Debug for AsyncTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTransaction")
            .field("location", self.config.location())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("channel", &self.channel.is_some())
            .finish_non_exhaustive()
    }
}

/// A worker pool running asynchronous transactions.
pub struct AsyncTransactionPipeline {
    pool: ThreadPool,
    escalated: Arc<AtomicUsize>,
}

static GLOBAL: OnceCell<AsyncTransactionPipeline> = OnceCell::new();

impl AsyncTransactionPipeline {
    /// Creates a pipeline with `threads` workers.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for zero threads, or `InvalidState` if the
    /// pool cannot be started.
    pub fn with_threads(threads: usize) -> CoreResult<Self> {
        if threads == 0 {
            return Err(CoreError::invalid_argument("worker pool needs at least one thread"));
        }
        let escalated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&escalated);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tetherdb-async-{i}"))
            .panic_handler(move |payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                error!(failure = %panic_message(payload.as_ref()), "unhandled async transaction failure");
            })
            .build()
            .map_err(|e| CoreError::invalid_state(format!("cannot start worker pool: {e}")))?;
        Ok(Self { pool, escalated })
    }

    /// The process-wide pipeline, created on first use.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the pool cannot be started.
    pub fn global() -> CoreResult<&'static Self> {
        GLOBAL.get_or_try_init(|| {
            let threads = std::thread::available_parallelism().map_or(2, |n| n.get().clamp(2, 8));
            Self::with_threads(threads)
        })
    }

    /// Number of failures escalated on workers.
    #[must_use]
    pub fn escalated_failures(&self) -> usize {
        self.escalated.load(Ordering::SeqCst)
    }

    /// Schedules `transaction` on a worker.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a callback is given without a notification
    /// channel to deliver it through.
    pub fn submit(&self, transaction: AsyncTransaction) -> CoreResult<CancellableTask> {
        let has_callback = transaction.on_success.is_some() || transaction.on_error.is_some();
        if has_callback && transaction.channel.is_none() {
            return Err(CoreError::invalid_state(
                "async transaction callbacks need a notification channel on the calling thread",
            ));
        }
        let task = CancellableTask::new();
        let inner = Arc::clone(&task.inner);
        self.pool.spawn(move || execute(transaction, &inner));
        Ok(task)
    }
}

impl fmt::Debug for AsyncTransactionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTransactionPipeline")
            .field("threads", &self.pool.current_num_threads())
            .field("escalated", &self.escalated_failures())
            .finish()
    }
}

fn execute(transaction: AsyncTransaction, task: &TaskInner) {
    let AsyncTransaction {
        config,
        mutation,
        on_success,
        on_error,
        channel,
    } = transaction;

    if task.cancelled.load(Ordering::Acquire) {
        debug!(location = %config.location(), "async transaction cancelled before it started");
        task.set(TaskState::Dropped);
        return;
    }
    task.set(TaskState::Running);

    let outcome = run_on_worker(&config, mutation);
    task.set(if outcome.is_ok() {
        TaskState::CommittedPending
    } else {
        TaskState::RolledBack
    });

    if task.cancelled.load(Ordering::Acquire) {
        debug!("async transaction outcome dropped after cancellation");
        task.set(TaskState::Dropped);
        if let Err(e) = outcome {
            warn!(error = %e, "cancelled async transaction failed");
            escalate(&e);
        }
        return;
    }

    let live = channel.filter(|c| c.is_alive());
    match outcome {
        Ok(version) => {
            let (Some(channel), Some(on_success)) = (live, on_success) else {
                debug!(%version, "async transaction committed; nothing to deliver");
                task.set(TaskState::Dropped);
                return;
            };
            let location = config.location().key();
            let posted = channel.post(Box::new(move || {
                refresh_thread_handles(&location, version);
                on_success();
            }));
            if !posted {
                debug!(%version, "async transaction result dropped; channel is dead");
            }
            task.set(if posted {
                TaskState::Delivered
            } else {
                TaskState::Dropped
            });
        }
        Err(e) => {
            let Some(channel) = live else {
                task.set(TaskState::Dropped);
                escalate(&e);
            };
            let message = e.to_string();
            let job: Box<dyn FnOnce() + Send> = match on_error {
                Some(on_error) => Box::new(move || on_error(e)),
                None => Box::new(move || {
                    escalate(&e);
                }),
            };
            if channel.post(job) {
                task.set(TaskState::Delivered);
            } else {
                task.set(TaskState::Dropped);
                escalate(&message);
            }
        }
    }
}

/// Opens a worker handle, runs `mutation`, and closes the handle. Returns
/// the committed version.
fn run_on_worker(config: &StoreConfiguration, mutation: Mutation) -> CoreResult<Version> {
    let handle = Handle::open(config)?;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        TransactionRunner::run(&handle, |h| mutation(h))
    }))
    .unwrap_or_else(|payload| {
        Err(CoreError::transaction_aborted(format!(
            "mutation panicked: {}",
            panic_message(payload.as_ref())
        )))
    });
    let version = handle.version();
    if let Err(e) = handle.close() {
        debug!(error = %e, "worker handle already released");
    }
    result.map(|()| version)
}

fn escalate(failure: &dyn fmt::Display) -> ! {
    panic!("unhandled async transaction failure: {failure}")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventLoop;
    use crate::schema::{ObjectSchema, PropertyType, StaticSchemaMediator};
    use crate::{ErrorKind, Value};
    use std::sync::mpsc;
    use tetherdb_storage::InMemoryBackend;

    fn config(name: &str) -> StoreConfiguration {
        let mediator = StaticSchemaMediator::new(vec![ObjectSchema::builder("Person")
            .property("id", PropertyType::Integer)
            .property("name", PropertyType::Text)
            .primary_key("id")
            .build()
            .unwrap()])
        .unwrap();
        StoreConfiguration::builder()
            .in_memory_backend(name, InMemoryBackend::new())
            .schema_version(1)
            .mediator(mediator)
            .build()
            .unwrap()
    }

    fn pipeline() -> AsyncTransactionPipeline {
        AsyncTransactionPipeline::with_threads(2).unwrap()
    }

    #[test]
    fn callback_without_channel_is_rejected() {
        let cfg = config("pipeline-no-channel");
        let err = AsyncTransaction::new(&cfg, |_| Ok(()))
            .channel(None)
            .on_success(|| {})
            .submit_to(&pipeline())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn zero_threads_is_invalid() {
        let err = AsyncTransactionPipeline::with_threads(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn success_is_delivered_once_on_origin_thread() {
        let cfg = config("pipeline-success");
        let event_loop = EventLoop::prepare();
        let handle = Handle::open(&cfg).unwrap();
        let origin = std::thread::current().id();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&calls);
        let task = handle
            .async_transaction(|h| {
                h.create_object_with_primary_key("Person", 1)?.set("name", "a")
            })
            .on_success(move || seen.lock().push(std::thread::current().id()))
            .submit_to(&pipeline())
            .unwrap();

        assert!(event_loop.run_until(Duration::from_secs(10), || !calls.lock().is_empty()));
        assert!(task.wait_timeout(Duration::from_secs(10)));
        assert_eq!(task.state(), TaskState::Delivered);
        event_loop.run_pending();
        assert_eq!(*calls.lock(), vec![origin]);

        let person = handle.find("Person", 1).unwrap().unwrap();
        assert_eq!(person.get("name").unwrap(), Value::from("a"));
    }

    #[test]
    fn listeners_run_before_success_callback() {
        let cfg = config("pipeline-ordering");
        let event_loop = EventLoop::prepare();
        let handle = Handle::open(&cfg).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let listener_order = Arc::clone(&order);
        handle.add_change_listener(move || listener_order.lock().push("changed"));
        let success_order = Arc::clone(&order);
        handle
            .async_transaction(|h| h.create_object_with_primary_key("Person", 2).map(drop))
            .on_success(move || success_order.lock().push("success"))
            .submit_to(&pipeline())
            .unwrap();

        assert!(event_loop.run_until(Duration::from_secs(10), || order.lock().contains(&"success")));
        assert_eq!(*order.lock(), vec!["changed", "success"]);
    }

    #[test]
    fn failure_is_routed_to_on_error() {
        let cfg = config("pipeline-failure");
        let event_loop = EventLoop::prepare();
        let handle = Handle::open(&cfg).unwrap();
        let (tx, rx) = mpsc::channel();

        handle
            .async_transaction(|h| {
                h.create_object_with_primary_key("Person", 1)?;
                h.create_object_with_primary_key("Person", 1).map(drop)
            })
            .on_success(|| panic!("must not succeed"))
            .on_error(move |e| tx.send(e.kind()).unwrap())
            .submit_to(&pipeline())
            .unwrap();

        let mut kind = None;
        assert!(event_loop.run_until(Duration::from_secs(10), || {
            kind = rx.try_recv().ok();
            kind.is_some()
        }));
        assert_eq!(kind, Some(ErrorKind::PrimaryKeyConstraintViolation));
        assert_eq!(handle.count("Person").unwrap(), 0);
    }

    #[test]
    fn cancelled_before_start_is_a_no_op() {
        let cfg = config("pipeline-cancel");
        let pool = AsyncTransactionPipeline::with_threads(1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.pool.spawn(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
        });

        let task = AsyncTransaction::new(&cfg, |h| h.create_object_with_primary_key("Person", 9).map(drop))
            .channel(None)
            .submit_to(&pool)
            .unwrap();
        task.cancel();
        release_tx.send(()).unwrap();

        assert!(task.wait_timeout(Duration::from_secs(10)));
        assert_eq!(task.state(), TaskState::Dropped);
        assert!(task.is_cancelled());
        let handle = Handle::open(&cfg).unwrap();
        assert_eq!(handle.count("Person").unwrap(), 0);
    }

    #[test]
    fn undeliverable_failure_is_escalated() {
        let cfg = config("pipeline-escalate");
        let pool = pipeline();
        let task = AsyncTransaction::new(&cfg, |_| Err(CoreError::transaction_aborted("nobody listens")))
            .channel(None)
            .submit_to(&pool)
            .unwrap();
        assert!(task.wait_timeout(Duration::from_secs(10)));
        assert_eq!(task.state(), TaskState::Dropped);

        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.escalated_failures() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.escalated_failures(), 1);
    }

    #[test]
    fn failure_without_on_error_is_rethrown_on_origin_thread() {
        let cfg = config("pipeline-rethrow");
        let event_loop = EventLoop::prepare();
        let pool = pipeline();
        let task = AsyncTransaction::new(&cfg, |_| Err(CoreError::transaction_aborted("no handler")))
            .submit_to(&pool)
            .unwrap();
        assert!(task.wait_timeout(Duration::from_secs(10)));
        assert_eq!(task.state(), TaskState::Delivered);

        let payload = panic::catch_unwind(AssertUnwindSafe(|| event_loop.run_pending())).unwrap_err();
        assert!(panic_message(payload.as_ref()).contains("no handler"));
        assert_eq!(pool.escalated_failures(), 0);
    }

    #[test]
    fn cancelled_while_running_still_commits() {
        let cfg = config("pipeline-cancel-running");
        let event_loop = EventLoop::prepare();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let succeeded = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&succeeded);
        let task = AsyncTransaction::new(&cfg, move |h| {
            started_tx.send(()).unwrap();
            release_rx.recv_timeout(Duration::from_secs(10)).unwrap();
            h.create_object_with_primary_key("Person", 5).map(drop)
        })
        .on_success(move || flag.store(true, Ordering::SeqCst))
        .submit_to(&pipeline())
        .unwrap();

        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        task.cancel();
        release_tx.send(()).unwrap();

        assert!(task.wait_timeout(Duration::from_secs(10)));
        assert_eq!(task.state(), TaskState::Dropped);
        event_loop.run_pending();
        assert!(!succeeded.load(Ordering::SeqCst));

        let handle = Handle::open(&cfg).unwrap();
        assert!(handle.find("Person", 5).unwrap().is_some());
    }

    #[test]
    fn cancelled_failure_is_escalated_on_worker() {
        let cfg = config("pipeline-cancel-failure");
        let event_loop = EventLoop::prepare();
        let pool = pipeline();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let task = AsyncTransaction::new(&cfg, move |_| {
            started_tx.send(()).unwrap();
            release_rx.recv_timeout(Duration::from_secs(10)).unwrap();
            Err(CoreError::transaction_aborted("failed after cancel"))
        })
        .on_error(|_| panic!("must not be delivered"))
        .submit_to(&pool)
        .unwrap();

        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        task.cancel();
        release_tx.send(()).unwrap();

        assert!(task.wait_timeout(Duration::from_secs(10)));
        assert_eq!(task.state(), TaskState::Dropped);
        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.escalated_failures() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.escalated_failures(), 1);
        assert_eq!(event_loop.run_pending(), 0);
    }

    #[test]
    fn dead_channel_drops_success() {
        let cfg = config("pipeline-dead-channel");
        let event_loop = EventLoop::new();
        let channel = event_loop.channel();
        drop(event_loop);

        let task = AsyncTransaction::new(&cfg, |h| h.create_object_with_primary_key("Person", 3).map(drop))
            .channel(Some(channel))
            .on_success(|| panic!("must not run"))
            .submit_to(&pipeline())
            .unwrap();
        assert!(task.wait_timeout(Duration::from_secs(10)));
        assert_eq!(task.state(), TaskState::Dropped);

        let handle = Handle::open(&cfg).unwrap();
        assert_eq!(handle.count("Person").unwrap(), 1);
    }
}
