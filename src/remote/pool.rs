//! Keyed pool of reusable remote connections.
//!
//! # Overview
//!
//! Connections are partitioned by [`ConnectionKey`] (host, port, user and a
//! password digest). Each partition keeps a FIFO queue of idle connections.
//!
//! - **Acquire**: pop an idle connection and probe it. A passing probe counts
//!   as a *reuse*; a failing probe discards the connection and a new one is
//!   created (counted as a *create*).
//! - **Release**: queue the connection if the partition holds fewer than
//!   `max_connections` idle entries, otherwise close it.
//! - **Invalidate**: close a connection the caller saw fail mid-operation.
//! - **Cleanup**: periodically close idle connections older than
//!   `idle_timeout` and any that lost their handle.
//!
//! Native handles are only ever closed by dropping them, and drops happen
//! after the pool lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::Serialize;

use super::connection::{ConnectionInfo, ConnectionKey, Connector, PooledConnection, Timeouts};
use super::TransportError;
use crate::tasks::lock_unpoisoned;

/// Errors returned by [`ConnectionPool::acquire`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A new connection could not be opened or failed its first probe.
    #[error("Failed to create connection for {key}: {source}")]
    Create {
        /// Partition the connection was meant for
        key: ConnectionKey,
        /// Why creation failed
        #[source]
        source: TransportError,
    },
}

impl PoolError {
    /// The transport error behind this pool error.
    #[must_use]
    pub fn transport_error(&self) -> &TransportError {
        match self {
            Self::Create { source, .. } => source,
        }
    }
}

impl From<PoolError> for TransportError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Create { source, .. } => source,
        }
    }
}

/// Configuration for a [`ConnectionPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle connections kept per partition (default: 10)
    pub max_connections: usize,
    /// Connect and response deadlines for new connections
    pub timeouts: Timeouts,
    /// Idle time after which cleanup closes a connection (default: 5 min)
    pub idle_timeout: Duration,
    /// Interval between janitor cleanup sweeps (default: 60 s)
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            timeouts: Timeouts::default(),
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Set the per-partition idle bound.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set the connect and response deadlines.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the idle eviction age.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the janitor interval.
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval.max(Duration::from_millis(10));
        self
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections opened
    pub created: u64,
    /// Idle connections handed out again after a passing probe
    pub reused: u64,
    /// Idle connections closed by cleanup
    pub timed_out: u64,
    /// Connections closed for any reason
    pub closed: u64,
    /// Connections currently checked out
    pub active: usize,
    /// Connections currently idle across all partitions
    pub idle: usize,
}

impl PoolStats {
    /// `reused / (created + reused)`, or `0.0` before any acquire.
    #[must_use]
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.created + self.reused;
        if total == 0 {
            0.0
        } else {
            self.reused as f64 / total as f64
        }
    }
}

/// Observer notified with fresh statistics after every pool state change.
pub type StatsObserver = Arc<dyn Fn(&PoolStats) + Send + Sync>;

struct PoolState<T: super::Transport> {
    idle: HashMap<ConnectionKey, VecDeque<PooledConnection<T>>>,
    active: usize,
    created: u64,
    reused: u64,
    timed_out: u64,
    closed: u64,
}

impl<T: super::Transport> PoolState<T> {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            created: self.created,
            reused: self.reused,
            timed_out: self.timed_out,
            closed: self.closed,
            active: self.active,
            idle: self.idle.values().map(VecDeque::len).sum(),
        }
    }
}

/// Thread-safe keyed connection pool.
///
/// # Example
///
/// ```no_run
/// use netdupe::remote::{ConnectionInfo, ConnectionPool, Credentials, FtpConnector, PoolConfig};
///
/// let pool = ConnectionPool::new(FtpConnector::new(), PoolConfig::default());
/// let info = ConnectionInfo::new("nas.local", 21, Credentials::anonymous());
///
/// let mut conn = pool.acquire(&info).unwrap();
/// match conn.list("/") {
///     Ok(listing) => {
///         println!("{} bytes", listing.len());
///         pool.release(conn);
///     }
///     Err(_) => pool.invalidate(conn),
/// }
/// println!("reuse ratio: {:.2}", pool.stats().reuse_ratio());
/// ```
pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<PoolState<C::Transport>>,
    observer: Mutex<Option<StatsObserver>>,
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("scheme", &self.connector.scheme())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create an empty pool.
    #[must_use]
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            state: Mutex::new(PoolState {
                idle: HashMap::new(),
                active: 0,
                created: 0,
                reused: 0,
                timed_out: 0,
                closed: 0,
            }),
            observer: Mutex::new(None),
        }
    }

    /// The connector used to open connections.
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Install an observer called after every state change.
    pub fn set_observer(&self, observer: StatsObserver) {
        *lock_unpoisoned(&self.observer) = Some(observer);
    }

    /// Check out a connection for `info`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Create`] if no idle connection passed its probe
    /// and a new connection could not be opened.
    pub fn acquire(
        &self,
        info: &ConnectionInfo,
    ) -> Result<PooledConnection<C::Transport>, PoolError> {
        let key = info.key();

        let candidate = {
            let mut state = lock_unpoisoned(&self.state);
            state.idle.get_mut(&key).and_then(VecDeque::pop_front)
        };

        if let Some(mut conn) = candidate {
            // Probe outside the lock; it is a network round trip.
            if conn.probe().is_ok() {
                conn.check_out();
                {
                    let mut state = lock_unpoisoned(&self.state);
                    state.reused += 1;
                    state.active += 1;
                }
                log::debug!("Reusing pooled connection for {}", key);
                self.notify();
                return Ok(conn);
            }
            log::debug!("Discarding stale pooled connection for {}", key);
            lock_unpoisoned(&self.state).closed += 1;
            drop(conn);
        }

        let mut conn = self.create(&key, info)?;
        conn.check_out();
        {
            let mut state = lock_unpoisoned(&self.state);
            state.created += 1;
            state.active += 1;
        }
        log::debug!("Created connection for {}", key);
        self.notify();
        Ok(conn)
    }

    fn create(
        &self,
        key: &ConnectionKey,
        info: &ConnectionInfo,
    ) -> Result<PooledConnection<C::Transport>, PoolError> {
        let handle = self
            .connector
            .connect(info, &self.config.timeouts)
            .map_err(|source| PoolError::Create {
                key: key.clone(),
                source,
            })?;

        let mut conn = PooledConnection::new(key.clone(), handle);
        conn.probe().map_err(|source| PoolError::Create {
            key: key.clone(),
            source,
        })?;
        Ok(conn)
    }

    /// Return a connection after use.
    ///
    /// The connection is queued for reuse if it is still valid and its
    /// partition has room; otherwise it is closed.
    pub fn release(&self, mut conn: PooledConnection<C::Transport>) {
        conn.check_in();
        let rejected = {
            let mut state = lock_unpoisoned(&self.state);
            state.active = state.active.saturating_sub(1);

            if !conn.is_valid() {
                state.closed += 1;
                Some(conn)
            } else {
                let max = self.config.max_connections;
                let queue = state.idle.entry(conn.key().clone()).or_default();
                if queue.len() < max {
                    queue.push_back(conn);
                    None
                } else {
                    state.closed += 1;
                    Some(conn)
                }
            }
        };

        if let Some(conn) = rejected {
            log::trace!("Closing released connection for {}", conn.key());
            drop(conn);
        }
        self.notify();
    }

    /// Close a connection the caller found broken.
    pub fn invalidate(&self, mut conn: PooledConnection<C::Transport>) {
        log::debug!("Invalidating connection for {}", conn.key());
        conn.invalidate();
        {
            let mut state = lock_unpoisoned(&self.state);
            state.active = state.active.saturating_sub(1);
            state.closed += 1;
        }
        drop(conn);
        self.notify();
    }

    /// Close idle connections past `idle_timeout` and any invalid ones.
    ///
    /// Returns the number of connections closed.
    pub fn cleanup_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = Vec::new();
        {
            let mut state = lock_unpoisoned(&self.state);
            let mut timed_out = 0;
            for queue in state.idle.values_mut() {
                let mut keep = VecDeque::with_capacity(queue.len());
                for conn in queue.drain(..) {
                    if !conn.is_valid() {
                        evicted.push(conn);
                    } else if conn.idle_for() > idle_timeout {
                        timed_out += 1;
                        evicted.push(conn);
                    } else {
                        keep.push_back(conn);
                    }
                }
                *queue = keep;
            }
            state.idle.retain(|_, queue| !queue.is_empty());
            state.timed_out += timed_out;
            state.closed += evicted.len() as u64;
        }

        let count = evicted.len();
        drop(evicted);
        if count > 0 {
            log::debug!("Pool cleanup closed {} idle connections", count);
            self.notify();
        }
        count
    }

    /// Close every idle connection.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut state = lock_unpoisoned(&self.state);
            let drained: Vec<_> = state
                .idle
                .drain()
                .flat_map(|(_, queue)| queue.into_iter())
                .collect();
            state.closed += drained.len() as u64;
            drained
        };
        let count = drained.len();
        drop(drained);
        log::debug!("Closed {} idle connections", count);
        self.notify();
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        lock_unpoisoned(&self.state).snapshot()
    }

    /// Reset the created/reused/timed-out/closed counters.
    pub fn reset_stats(&self) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.created = 0;
            state.reused = 0;
            state.timed_out = 0;
            state.closed = 0;
        }
        self.notify();
    }

    /// Number of idle connections in one partition.
    #[must_use]
    pub fn idle_count(&self, key: &ConnectionKey) -> usize {
        lock_unpoisoned(&self.state)
            .idle
            .get(key)
            .map_or(0, VecDeque::len)
    }

    fn notify(&self) {
        let observer = lock_unpoisoned(&self.observer).clone();
        if let Some(observer) = observer {
            let stats = self.stats();
            observer(&stats);
        }
    }
}

/// Background thread running [`ConnectionPool::cleanup_idle`] periodically.
///
/// The janitor holds only a weak reference to the pool and stops when either
/// the janitor or the pool is dropped.
pub struct PoolJanitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    sweeps: Arc<AtomicU64>,
}

impl PoolJanitor {
    /// Start a janitor for `pool` using the pool's cleanup interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<C: Connector>(pool: &Arc<ConnectionPool<C>>) -> std::io::Result<Self> {
        let interval = pool.config().cleanup_interval;
        let weak: Weak<ConnectionPool<C>> = Arc::downgrade(pool);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let sweeps = Arc::new(AtomicU64::new(0));
        let thread_sweeps = Arc::clone(&sweeps);

        let handle = thread::Builder::new()
            .name("netdupe-pool-janitor".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(pool) = weak.upgrade() else {
                            break;
                        };
                        pool.cleanup_idle();
                        thread_sweeps.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
            sweeps,
        })
    }

    /// Number of completed cleanup sweeps.
    #[must_use]
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }
}

impl Drop for PoolJanitor {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
