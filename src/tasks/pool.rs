//! Fixed-size worker thread pool.
//!
//! Workers consume boxed closures from an unbounded FIFO channel. A panic
//! escaping a task is caught at the worker boundary and logged; the worker
//! keeps serving the queue.
//!
//! The pool is an ordinary value: construct one, share it through an `Arc`,
//! and drop it to join the workers. There is no process-wide instance.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{lock_unpoisoned, CancelToken, TaskPoolError};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PoolCounters {
    active: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
}

/// Fixed-size pool of worker threads executing queued closures.
///
/// # Example
///
/// ```
/// use netdupe::tasks::TaskPool;
///
/// let pool = TaskPool::new(4).unwrap();
/// let token = pool
///     .enqueue_cancellable(|token| {
///         for _ in 0..1000 {
///             if token.is_cancelled() {
///                 return;
///             }
///         }
///     })
///     .unwrap();
/// token.cancel();
/// pool.shutdown();
/// ```
pub struct TaskPool {
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
    size: usize,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("size", &self.size)
            .field("pending", &self.pending_count())
            .field("active", &self.active_count())
            .finish()
    }
}

impl TaskPool {
    /// Create a pool with `threads` workers.
    ///
    /// `0` selects the hardware concurrency reported by the OS.
    ///
    /// # Errors
    ///
    /// Returns [`TaskPoolError::Spawn`] if a worker thread cannot be created.
    /// Workers spawned before the failure are shut down.
    pub fn new(threads: usize) -> Result<Self, TaskPoolError> {
        let size = if threads == 0 {
            default_thread_count()
        } else {
            threads
        };

        let (sender, receiver) = unbounded::<Job>();
        let counters = Arc::new(PoolCounters::default());
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let rx = receiver.clone();
            let worker_counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("netdupe-worker-{index}"))
                .spawn(move || run_worker(index, rx, worker_counters))
                .map_err(TaskPoolError::Spawn)?;
            workers.push(handle);
        }

        log::debug!("Task pool started with {} workers", size);

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(workers),
            counters,
            size,
        })
    }

    /// Queue a fire-and-forget task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskPoolError::ShutDown`] after [`TaskPool::shutdown`].
    pub fn enqueue<F>(&self, task: F) -> Result<(), TaskPoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = lock_unpoisoned(&self.sender);
        match sender.as_ref() {
            Some(tx) => tx.send(Box::new(task)).map_err(|_| TaskPoolError::ShutDown),
            None => Err(TaskPoolError::ShutDown),
        }
    }

    /// Queue a task that receives a cancellation token.
    ///
    /// The returned token is shared with the task. Cancelling it does not
    /// interrupt the task; the task is expected to poll the token.
    ///
    /// # Errors
    ///
    /// Returns [`TaskPoolError::ShutDown`] after [`TaskPool::shutdown`].
    pub fn enqueue_cancellable<F>(&self, task: F) -> Result<CancelToken, TaskPoolError>
    where
        F: FnOnce(&CancelToken) + Send + 'static,
    {
        let token = CancelToken::new();
        let task_token = token.clone();
        self.enqueue(move || task(&task_token))?;
        Ok(token)
    }

    /// Discard every task still waiting in the queue.
    ///
    /// Running tasks are unaffected. Discarded closures are dropped, which
    /// releases anything they captured (including latch guards).
    ///
    /// Returns the number of discarded tasks.
    pub fn clear_pending(&self) -> usize {
        let mut discarded = 0;
        while let Ok(job) = self.receiver.try_recv() {
            drop(job);
            discarded += 1;
        }
        if discarded > 0 {
            log::debug!("Discarded {} pending tasks", discarded);
        }
        discarded
    }

    /// Number of tasks waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    /// Number of tasks currently executing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Number of tasks that finished (including ones that panicked).
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.counters.completed.load(Ordering::SeqCst)
    }

    /// Number of tasks that panicked.
    #[must_use]
    pub fn panicked_count(&self) -> usize {
        self.counters.panicked.load(Ordering::SeqCst)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop accepting tasks, let queued tasks drain, and join the workers.
    ///
    /// Calling this more than once is harmless.
    pub fn shutdown(&self) {
        lock_unpoisoned(&self.sender).take();
        let workers: Vec<_> = lock_unpoisoned(&self.workers).drain(..).collect();
        let current = thread::current().id();
        for handle in workers {
            // A task that owns the last handle to the pool ends up here on
            // its own worker thread.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::warn!("Task pool worker terminated abnormally");
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(index: usize, rx: Receiver<Job>, counters: Arc<PoolCounters>) {
    log::trace!("Worker {} started", index);
    for job in rx.iter() {
        counters.active.fetch_add(1, Ordering::SeqCst);
        let outcome = catch_unwind(AssertUnwindSafe(job));
        counters.active.fetch_sub(1, Ordering::SeqCst);
        counters.completed.fetch_add(1, Ordering::SeqCst);

        if let Err(payload) = outcome {
            counters.panicked.fetch_add(1, Ordering::SeqCst);
            log::error!(
                "Task panicked on worker {}: {}",
                index,
                panic_message(payload.as_ref())
            );
        }
    }
    log::trace!("Worker {} stopped", index);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Hardware concurrency, falling back to a single worker.
#[must_use]
pub fn default_thread_count() -> usize {
    thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}
