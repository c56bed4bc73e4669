//! Event-loop pumping and callback recording.
//!
//! Async results and change signals reach a thread only while it pumps its
//! [`EventLoop`]. These helpers pump with a bounded wait so a missing
//! delivery fails a test instead of hanging it.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tetherdb_core::EventLoop;

/// How long the pumping helpers wait before giving up.
pub const DEFAULT_PUMP_TIMEOUT: Duration = Duration::from_secs(10);

/// Pumps `event_loop` until `done` holds or [`DEFAULT_PUMP_TIMEOUT`]
/// elapses.
pub fn pump_until(event_loop: &EventLoop, done: impl FnMut() -> bool) -> bool {
    event_loop.run_until(DEFAULT_PUMP_TIMEOUT, done)
}

/// Pumps `event_loop` for `period`, returning how many jobs ran.
///
/// Used to check that nothing further arrives.
pub fn pump_for(event_loop: &EventLoop, period: Duration) -> usize {
    let deadline = Instant::now() + period;
    let mut ran = 0;
    while Instant::now() < deadline {
        ran += event_loop.run_pending();
        thread::sleep(Duration::from_millis(5));
    }
    ran + event_loop.run_pending()
}

/// Ordered log of events, shareable across threads and callbacks.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened.
    pub label: String,
    /// Name of the thread it happened on.
    pub thread: Option<String>,
}

impl Recorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `label` on the calling thread.
    pub fn record(&self, label: impl Into<String>) {
        self.events.lock().push(Event {
            label: label.into(),
            thread: thread::current().name().map(str::to_string),
        });
    }

    /// A callback that records `label` when called.
    pub fn hook(&self, label: &str) -> impl Fn() + Send + Sync + 'static {
        let recorder = self.clone();
        let label = label.to_string();
        move || recorder.record(label.clone())
    }

    /// Every label, in order.
    pub fn labels(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.label.clone()).collect()
    }

    /// Every event, in order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// How many times `label` was recorded.
    pub fn count(&self, label: &str) -> usize {
        self.events.lock().iter().filter(|e| e.label == label).count()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
