//! Cross-thread notification channels.
//!
//! A [`NotificationChannel`] lets any thread hand work to one specific
//! thread. The core only needs `post` and `is_alive`; [`EventLoop`] is the
//! implementation shipped with TetherDB, a plain message loop over
//! `std::sync::mpsc` that the owning thread pumps.
//!
//! # Usage
//!
//! ```rust
//! use tetherdb_core::notify::{current_channel, EventLoop};
//!
//! let event_loop = EventLoop::prepare();
//! let channel = current_channel().unwrap();
//! std::thread::spawn(move || {
//!     channel.post(Box::new(|| println!("runs on the loop thread")));
//! })
//! .join()
//! .unwrap();
//! assert_eq!(event_loop.run_pending(), 1);
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A unit of work posted to another thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Endpoint that runs posted jobs on its owning thread.
pub trait NotificationChannel: Send + Sync {
    /// Enqueues `job`. Returns false if the channel is dead and the job was
    /// dropped.
    fn post(&self, job: Job) -> bool;

    /// Returns true while the owning thread still accepts jobs.
    fn is_alive(&self) -> bool;
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<dyn NotificationChannel>>> = const { RefCell::new(None) };
}

/// Returns the channel installed for the calling thread, if any.
#[must_use]
pub fn current_channel() -> Option<Arc<dyn NotificationChannel>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Returns true if both references point at the same channel.
#[must_use]
pub fn same_channel(a: &Arc<dyn NotificationChannel>, b: &Arc<dyn NotificationChannel>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

struct LoopChannel {
    sender: Sender<Job>,
    alive: AtomicBool,
}

impl NotificationChannel for LoopChannel {
    fn post(&self, job: Job) -> bool {
        self.alive.load(Ordering::Acquire) && self.sender.send(job).is_ok()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// A thread's message loop.
///
/// The loop is bound to the thread that created it. Jobs run only when that
/// thread calls [`run_pending`](Self::run_pending) or
/// [`run_until`](Self::run_until). Dropping the loop kills its channel;
/// later posts are refused.
pub struct EventLoop {
    receiver: Receiver<Job>,
    channel: Arc<LoopChannel>,
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Creates a loop without installing it.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            receiver,
            channel: Arc::new(LoopChannel {
                sender,
                alive: AtomicBool::new(true),
            }),
            _not_send: PhantomData,
        }
    }

    /// Creates a loop and installs it as the calling thread's channel.
    ///
    /// Handles opened on this thread afterwards deliver change
    /// notifications and async transaction results through it.
    #[must_use]
    pub fn prepare() -> Self {
        let event_loop = Self::new();
        let channel = event_loop.channel();
        CURRENT.with(|c| *c.borrow_mut() = Some(channel));
        event_loop
    }

    /// The loop's channel.
    #[must_use]
    pub fn channel(&self) -> Arc<dyn NotificationChannel> {
        let channel: Arc<dyn NotificationChannel> = self.channel.clone();
        channel
    }

    /// Runs every job already queued. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Runs jobs as they arrive until `done` returns true or `timeout`
    /// elapses. Returns the final value of `done`.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.receiver.recv_timeout(remaining) {
                Ok(job) => job(),
                Err(RecvTimeoutError::Timeout) => return done(),
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.channel.alive.store(false, Ordering::Release);
        let ours = self.channel();
        // The thread-local may already be gone during thread teardown.
        let _ = CURRENT.try_with(|c| {
            let mut current = c.borrow_mut();
            if current.as_ref().is_some_and(|installed| same_channel(installed, &ours)) {
                *current = None;
            }
        });
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("alive", &self.channel.is_alive())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn jobs_run_on_owner_thread() {
        let event_loop = EventLoop::new();
        let channel = event_loop.channel();
        let owner = thread::current().id();
        let seen = Arc::new(parking_lot::Mutex::new(None));

        let seen2 = Arc::clone(&seen);
        thread::spawn(move || {
            assert!(channel.post(Box::new(move || {
                *seen2.lock() = Some(thread::current().id());
            })));
        })
        .join()
        .unwrap();

        assert!(seen.lock().is_none());
        assert_eq!(event_loop.run_pending(), 1);
        assert_eq!(*seen.lock(), Some(owner));
    }

    #[test]
    fn jobs_run_in_order() {
        let event_loop = EventLoop::new();
        let channel = event_loop.channel();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            channel.post(Box::new(move || order.lock().push(i)));
        }
        event_loop.run_pending();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dropped_loop_refuses_posts() {
        let event_loop = EventLoop::prepare();
        let channel = current_channel().unwrap();
        assert!(channel.is_alive());
        drop(event_loop);
        assert!(!channel.is_alive());
        assert!(!channel.post(Box::new(|| {})));
        assert!(current_channel().is_none());
    }

    #[test]
    fn run_until_waits_for_jobs() {
        let event_loop = EventLoop::new();
        let channel = event_loop.channel();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            channel.post(Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
            }));
        });
        assert!(event_loop.run_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 1));
        poster.join().unwrap();
        assert!(!event_loop.run_until(Duration::from_millis(10), || false));
    }
}
