//! Counting completion signal.
//!
//! A [`CompletionLatch`] counts outstanding units of work. Each unit holds a
//! [`LatchGuard`]; dropping the guard counts the unit down, whether the task
//! ran to completion, returned early, panicked, or was discarded from the
//! queue without running. Waiters wake as soon as the count reaches zero.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::lock_unpoisoned;

#[derive(Debug, Default)]
struct LatchInner {
    outstanding: Mutex<usize>,
    zero: Condvar,
}

/// Counting completion signal for one phase of work.
#[derive(Debug, Clone, Default)]
pub struct CompletionLatch {
    inner: Arc<LatchInner>,
}

impl CompletionLatch {
    /// Create a latch with no outstanding work.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of outstanding work.
    ///
    /// The returned guard must be moved into the task; it counts down
    /// when dropped.
    #[must_use]
    pub fn guard(&self) -> LatchGuard {
        *lock_unpoisoned(&self.inner.outstanding) += 1;
        LatchGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of units that have not finished yet.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        *lock_unpoisoned(&self.inner.outstanding)
    }

    /// Block until every registered unit has finished.
    pub fn wait(&self) {
        let mut count = lock_unpoisoned(&self.inner.outstanding);
        while *count > 0 {
            count = self
                .inner
                .zero
                .wait(count)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Block until every unit has finished or `timeout` elapses.
    ///
    /// Returns `true` if the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = lock_unpoisoned(&self.inner.outstanding);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .zero
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            count = guard;
        }
        true
    }
}

/// One unit of outstanding work registered with a [`CompletionLatch`].
#[derive(Debug)]
pub struct LatchGuard {
    inner: Arc<LatchInner>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        let mut count = lock_unpoisoned(&self.inner.outstanding);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }
}
