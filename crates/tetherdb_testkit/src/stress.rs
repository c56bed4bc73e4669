//! Stress tests for TetherDB.
//!
//! These exercise the write lock, the handle registry and the async
//! pipeline under concurrent load.

use crate::fixtures::note;
use crate::pump::pump_until;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tetherdb_core::{
    AsyncTransactionPipeline, CoreError, EventLoop, Handle, StoreConfiguration,
};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
        }
    }
}

/// Runs write transactions from several threads, each on its own handle.
pub fn stress_concurrent_writers(
    store: &StoreConfiguration,
    config: &StressConfig,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();

    let workers: Vec<_> = (0..config.threads)
        .map(|t| {
            let store = store.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                let handle = match Handle::open(&store) {
                    Ok(handle) => handle,
                    Err(_) => {
                        failed.fetch_add(ops_per_thread, Ordering::Relaxed);
                        return;
                    }
                };
                for i in 0..ops_per_thread {
                    let text = format!("thread-{t}-note-{i}");
                    match handle.execute_transaction(|h| h.copy_to_store(&note(&text)).map(drop)) {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for worker in workers {
        let _ = worker.join();
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Runs transactions where every other mutation fails and must roll back.
pub fn stress_transaction_aborts(handle: &Handle, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let result = handle.execute_transaction(|h| {
            h.copy_to_store(&note(&format!("note-{i}")))?;
            if i % 2 == 1 {
                return Err(CoreError::transaction_aborted("intentional abort"));
            }
            Ok(())
        });

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Submits a burst of async transactions from the calling thread and pumps
/// `event_loop` until every outcome is delivered.
///
/// `handle` must have been opened after `event_loop` was prepared.
/// Successful operations count `on_success` deliveries; failed operations
/// count `on_error` deliveries and outcomes that never arrived.
pub fn stress_async_burst(
    handle: &Handle,
    event_loop: &EventLoop,
    config: &StressConfig,
) -> StressTestResult {
    let pipeline = match AsyncTransactionPipeline::with_threads(config.threads.max(1)) {
        Ok(pipeline) => pipeline,
        Err(_) => return StressTestResult::new(0, config.operations, Duration::ZERO),
    };
    let successes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut submitted = 0usize;
    for i in 0..config.operations {
        let s = Arc::clone(&successes);
        let e = Arc::clone(&errors);
        let task = handle
            .async_transaction(move |h| h.copy_to_store(&note(&format!("async-{i}"))).map(drop))
            .on_success(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            })
            .submit_to(&pipeline);
        if task.is_ok() {
            submitted += 1;
        }
    }

    pump_until(event_loop, || {
        successes.load(Ordering::SeqCst) + errors.load(Ordering::SeqCst) >= submitted
    });

    let successful = successes.load(Ordering::SeqCst);
    StressTestResult::new(successful, config.operations - successful, start.elapsed())
}
