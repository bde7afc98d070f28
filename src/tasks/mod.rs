//! Task execution infrastructure shared by every scan phase.
//!
//! This module provides:
//! - [`TaskPool`]: a fixed-size pool of worker threads consuming a FIFO queue
//! - [`CancelToken`]: a cooperative cancellation flag handed to cancellable tasks
//! - [`CompletionLatch`]: a counting completion signal used to detect when every
//!   task of a phase has finished (or was dropped from the queue)
//!
//! # Example
//!
//! ```
//! use netdupe::tasks::{CompletionLatch, TaskPool};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = TaskPool::new(2).unwrap();
//! let latch = CompletionLatch::new();
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..10 {
//!     let guard = latch.guard();
//!     let counter = Arc::clone(&counter);
//!     pool.enqueue(move || {
//!         let _guard = guard;
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     })
//!     .unwrap();
//! }
//!
//! latch.wait();
//! assert_eq!(counter.load(Ordering::SeqCst), 10);
//! ```

pub mod latch;
pub mod pool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use latch::{CompletionLatch, LatchGuard};
pub use pool::TaskPool;

/// Shared cancellation flag for a cancellable task.
///
/// The pool never interrupts running work; the task itself polls
/// [`CancelToken::is_cancelled`] at convenient points (e.g. between
/// read chunks) and returns early.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Errors returned by [`TaskPool`].
#[derive(thiserror::Error, Debug)]
pub enum TaskPoolError {
    /// The OS refused to create a worker thread.
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The pool was shut down and accepts no new tasks.
    #[error("Task pool is shut down")]
    ShutDown,
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Tasks run under `catch_unwind`, so a panic while holding a table lock
/// must not take the rest of the scan down with it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
