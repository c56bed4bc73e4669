//! Cross-module scenario tests.
//!
//! Each scenario drives handles, transactions, the async pipeline and the
//! materializer together, the way an application would.

use std::thread;

/// Runs `f` on a fresh named thread and returns its result.
///
/// Handles are confined to the thread that opened them, so scenarios that
/// need a second participant open their own handle inside `f`.
pub fn on_thread<T, F>(name: &str, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("Failed to spawn thread")
        .join()
        .expect("Scenario thread panicked")
}
