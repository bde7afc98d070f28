//! Non-blocking multi-transfer engine.
//!
//! [`MultiTransfer`] is the contract the listing multiplexer drives: register
//! transfers with [`MultiTransfer::add`] and collect finished ones with
//! [`MultiTransfer::perform`], which never blocks on the network.
//!
//! [`PooledTransfers`] implements it with a small fixed set of transfer
//! threads. Each thread takes a queued request, checks out a connection from
//! the [`ConnectionPool`], runs the listing, and hands the connection back
//! (or invalidates it on failure). Hundreds of requests can be outstanding
//! while only `connections` sockets are ever in use at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::connection::{ConnectionInfo, Connector, TransportError};
use super::pool::ConnectionPool;

/// One listing transfer to perform.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Caller-chosen identifier echoed back in [`TransferDone`]
    pub token: u64,
    /// Server and identity to list with
    pub info: ConnectionInfo,
    /// Directory to list
    pub directory: String,
    /// Full listing URL, for logging
    pub url: String,
}

/// A finished transfer.
#[derive(Debug, Clone)]
pub struct TransferDone {
    /// Token of the originating request
    pub token: u64,
    /// Raw listing bytes, or the failure
    pub result: Result<Vec<u8>, TransportError>,
}

/// Errors raised when registering a transfer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The engine could not allocate its transfer threads.
    #[error("Transfer engine failed to initialize: {0}")]
    Init(String),

    /// The engine was shut down.
    #[error("Transfer engine is shut down")]
    Closed,
}

/// Non-blocking engine servicing many transfers concurrently.
pub trait MultiTransfer: Send {
    /// Register a transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot accept the transfer.
    fn add(&mut self, request: TransferRequest) -> Result<(), TransferError>;

    /// Advance the engine and return every transfer finished since the last
    /// call. Must return promptly.
    fn perform(&mut self) -> Vec<TransferDone>;

    /// Abandon every registered transfer. Results of abandoned transfers are
    /// never returned.
    fn cancel_all(&mut self);

    /// Number of registered transfers not yet returned by `perform`.
    fn in_flight(&self) -> usize;

    /// Transfers the engine can work on at once. Requests added beyond this
    /// wait inside the engine without making progress.
    fn capacity(&self) -> usize {
        usize::MAX
    }
}

struct Job {
    generation: u64,
    request: TransferRequest,
}

/// [`MultiTransfer`] backed by a connection pool and a fixed set of threads.
pub struct PooledTransfers<C: Connector> {
    jobs: Option<Sender<Job>>,
    done: Receiver<(u64, TransferDone)>,
    workers: Vec<JoinHandle<()>>,
    generation: Arc<AtomicU64>,
    in_flight: usize,
    connections: usize,
    pool: Arc<ConnectionPool<C>>,
}

impl<C: Connector> PooledTransfers<C> {
    /// Start `connections` transfer threads over `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Init`] if a thread cannot be spawned.
    pub fn new(pool: Arc<ConnectionPool<C>>, connections: usize) -> Result<Self, TransferError> {
        let connections = connections.max(1);
        let (job_tx, job_rx) = unbounded::<Job>();
        let (done_tx, done_rx) = unbounded();
        let generation = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(connections);
        for index in 0..connections {
            let rx = job_rx.clone();
            let tx = done_tx.clone();
            let worker_pool = Arc::clone(&pool);
            let worker_generation = Arc::clone(&generation);
            let spawned = thread::Builder::new()
                .name(format!("netdupe-transfer-{index}"))
                .spawn(move || run_transfers(&worker_pool, &rx, &tx, &worker_generation));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Dropping the sender stops the threads already started
                    drop(job_tx);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(TransferError::Init(e.to_string()));
                }
            }
        }

        log::debug!("Started {} transfer connections", connections);

        Ok(Self {
            jobs: Some(job_tx),
            done: done_rx,
            workers,
            generation,
            in_flight: 0,
            connections,
            pool,
        })
    }

    /// The pool backing this engine.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }
}

impl<C: Connector> MultiTransfer for PooledTransfers<C> {
    fn add(&mut self, request: TransferRequest) -> Result<(), TransferError> {
        let jobs = self.jobs.as_ref().ok_or(TransferError::Closed)?;
        let job = Job {
            generation: self.generation.load(Ordering::SeqCst),
            request,
        };
        jobs.send(job).map_err(|_| TransferError::Closed)?;
        self.in_flight += 1;
        Ok(())
    }

    fn perform(&mut self) -> Vec<TransferDone> {
        let current = self.generation.load(Ordering::SeqCst);
        let mut finished = Vec::new();
        while let Ok((generation, done)) = self.done.try_recv() {
            if generation == current {
                self.in_flight = self.in_flight.saturating_sub(1);
                finished.push(done);
            }
        }
        finished
    }

    fn cancel_all(&mut self) {
        let abandoned = self.in_flight;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.in_flight = 0;
        // Stale results would be filtered anyway; drain to free memory.
        while self.done.try_recv().is_ok() {}
        if abandoned > 0 {
            log::debug!("Abandoned {} in-flight transfers", abandoned);
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn capacity(&self) -> usize {
        self.connections
    }
}

impl<C: Connector> Drop for PooledTransfers<C> {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_transfers<C: Connector>(
    pool: &ConnectionPool<C>,
    jobs: &Receiver<Job>,
    done: &Sender<(u64, TransferDone)>,
    generation: &AtomicU64,
) {
    for job in jobs.iter() {
        // Skip work abandoned by cancel_all before it started
        if job.generation != generation.load(Ordering::SeqCst) {
            continue;
        }

        log::trace!("Listing {}", job.request.url);
        let result = list_once(pool, &job.request);
        let finished = TransferDone {
            token: job.request.token,
            result,
        };
        if done.send((job.generation, finished)).is_err() {
            break;
        }
    }
}

fn list_once<C: Connector>(
    pool: &ConnectionPool<C>,
    request: &TransferRequest,
) -> Result<Vec<u8>, TransportError> {
    let mut conn = pool.acquire(&request.info)?;
    match conn.list(&request.directory) {
        Ok(bytes) => {
            pool.release(conn);
            Ok(bytes)
        }
        Err(e) => {
            // A protocol answer (e.g. 550) leaves the session usable
            if matches!(e, TransportError::Protocol(_)) {
                pool.release(conn);
            } else {
                pool.invalidate(conn);
            }
            Err(e)
        }
    }
}
