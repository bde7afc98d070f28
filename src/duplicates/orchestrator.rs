//! The phased duplicate-detection pipeline.
//!
//! # Overview
//!
//! [`ScanOrchestrator::start_scan`] runs one scan on a dedicated driver
//! thread:
//!
//! 1. **Collecting**: one task-pool job per local root; remote roots are
//!    walked through a [`ListingMultiplexer`] stepped on the driver thread.
//! 2. **SizeFiltering**: collected files are grouped by size; unique sizes
//!    are dropped.
//! 3. **QuickHashing**: head + tail + size hash of every candidate (skipped
//!    in Accurate mode).
//! 4. **FullHashing**: BLAKE3 of every candidate in Accurate mode, or of
//!    quick-hash collisions when confirmation is enabled.
//! 5. **Comparing**: final grouping and keep-policy selection.
//!
//! Each phase ends when its [`CompletionLatch`] reaches zero. The driver
//! waits on the latch with a short timeout so it can report progress and
//! notice a stop request between wake-ups.
//!
//! Work within a phase runs on the shared [`TaskPool`]. A failing file or
//! root never aborts the scan; only losing the task pool does.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use crossbeam_channel::{unbounded, Sender};
use serde::Serialize;

use super::events::ScanListener;
use super::groups::{group_by_hash, group_by_size, DuplicateGroup, HashValue, KeepPolicy};
use super::{AtomicPhase, ScanPhase, SpeedMode};
use crate::remote::{
    resolve_credentials, ConnectionInfo, ConnectionPool, Connector, CredentialProvider,
    Credentials, ListingMultiplexer, ListingTarget, MultiplexerConfig, PooledTransfers,
    RemoteLocator, ScanRoot,
};
use crate::scanner::{
    collect_local, CollectionTable, HashError, Hasher, LocalCollectorConfig, Location,
    RemoteCollector, RemoteCollectorConfig, ScanError,
};
use crate::tasks::{lock_unpoisoned, CancelToken, CompletionLatch, TaskPool, TaskPoolError};

/// Minimum files per quick-hash job.
const QUICK_BATCH_MIN: usize = 100;

/// Minimum files per full-hash job.
const FULL_BATCH_MIN: usize = 50;

/// Configuration for a [`ScanOrchestrator`].
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Files smaller than this are not candidates (default: 0)
    pub min_size: u64,
    /// Full-hash quick-hash collisions before grouping them (default: false)
    pub confirm_quick_collisions: bool,
    /// Extra gitignore-style patterns skipped by local collection
    pub exclude_patterns: Vec<String>,
    /// Interval between progress reports (default: 100 ms)
    pub progress_interval: Duration,
    /// Which group member to mark as the one to keep
    pub keep_policy: KeepPolicy,
    /// Listing multiplexer timing and retry policy
    pub multiplexer: MultiplexerConfig,
    /// Remote traversal limits
    pub remote: RemoteCollectorConfig,
    /// Transfer threads (and so live connections) used for remote listings
    pub transfer_connections: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            confirm_quick_collisions: false,
            exclude_patterns: Vec::new(),
            progress_interval: Duration::from_millis(100),
            keep_policy: KeepPolicy::default(),
            multiplexer: MultiplexerConfig::default(),
            remote: RemoteCollectorConfig::default(),
            transfer_connections: 24,
        }
    }
}

impl ScanConfig {
    /// Set the minimum candidate size.
    #[must_use]
    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    /// Enable or disable full-hash confirmation of quick-hash collisions.
    #[must_use]
    pub fn with_confirm_quick_collisions(mut self, confirm: bool) -> Self {
        self.confirm_quick_collisions = confirm;
        self
    }

    /// Set extra exclude patterns for local collection.
    #[must_use]
    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Set the progress report interval.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the keep policy.
    #[must_use]
    pub fn with_keep_policy(mut self, policy: KeepPolicy) -> Self {
        self.keep_policy = policy;
        self
    }

    /// Set the multiplexer configuration.
    #[must_use]
    pub fn with_multiplexer(mut self, config: MultiplexerConfig) -> Self {
        self.multiplexer = config;
        self
    }

    /// Set remote traversal limits.
    #[must_use]
    pub fn with_remote(mut self, config: RemoteCollectorConfig) -> Self {
        self.remote = config;
        self
    }

    /// Set the number of transfer connections.
    #[must_use]
    pub fn with_transfer_connections(mut self, connections: usize) -> Self {
        self.transfer_connections = connections.max(1);
        self
    }
}

/// Outcome of [`ScanOrchestrator::start_scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// The scan was started
    Started,
    /// Another scan is still running; nothing was started
    AlreadyRunning,
}

/// Fatal orchestrator errors.
#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    /// The driver thread could not be created.
    #[error("Failed to start scan thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The task pool rejected work.
    #[error(transparent)]
    TaskPool(#[from] TaskPoolError),
}

/// Counters describing one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    /// Files collected across all roots
    pub files_collected: usize,
    /// Files sharing their size with another file
    pub candidates: usize,
    /// Files quick-hashed successfully
    pub quick_hashed: usize,
    /// Files full-hashed successfully
    pub full_hashed: usize,
    /// Files that could not be hashed
    pub hash_failures: usize,
    /// Roots that could not be scanned
    pub roots_failed: usize,
    /// Remote subdirectories whose listing failed
    pub directories_failed: usize,
    /// Listing lines matching no known format
    pub unparseable_lines: usize,
    /// Wall time of the scan in milliseconds
    pub elapsed_ms: u64,
}

/// Result of a completed scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    /// Speed mode the scan ran in
    pub mode: SpeedMode,
    /// Duplicate groups, most wasted space first
    pub groups: Vec<DuplicateGroup>,
    /// Size of every collected file
    #[serde(skip)]
    pub sizes: BTreeMap<Location, u64>,
    /// Scan counters
    pub stats: ScanStats,
    /// Messages of the per-root errors reported during the scan
    pub root_errors: Vec<String>,
}

impl ScanResult {
    /// Total bytes reclaimable by keeping one file per group.
    #[must_use]
    pub fn wasted_space(&self) -> u64 {
        self.groups.iter().map(DuplicateGroup::wasted_space).sum()
    }

    /// Number of files that duplicate another file.
    #[must_use]
    pub fn duplicate_files(&self) -> usize {
        self.groups.iter().map(|g| g.len() - 1).sum()
    }
}

#[derive(Debug)]
struct Shared {
    phase: AtomicPhase,
    scanning: AtomicBool,
    stop: AtomicBool,
    tokens: Mutex<Vec<CancelToken>>,
}

impl Shared {
    fn track(&self, token: CancelToken) {
        if self.stop.load(Ordering::SeqCst) {
            token.cancel();
        }
        lock_unpoisoned(&self.tokens).push(token);
    }

    fn cancel_all(&self) {
        for token in lock_unpoisoned(&self.tokens).iter() {
            token.cancel();
        }
    }
}

/// Runs duplicate scans over local and remote roots.
///
/// The task pool and connection pool are passed in and may be shared with
/// other components. Only one scan runs at a time.
pub struct ScanOrchestrator<C: Connector> {
    config: ScanConfig,
    tasks: Arc<TaskPool>,
    connections: Arc<ConnectionPool<C>>,
    credentials: Arc<dyn CredentialProvider>,
    listener: Arc<dyn ScanListener>,
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<ScanPhase>>>,
}

impl<C: Connector> fmt::Debug for ScanOrchestrator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("config", &self.config)
            .field("tasks", &self.tasks)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ScanOrchestrator<C> {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(
        config: ScanConfig,
        tasks: Arc<TaskPool>,
        connections: Arc<ConnectionPool<C>>,
        credentials: Arc<dyn CredentialProvider>,
        listener: Arc<dyn ScanListener>,
    ) -> Self {
        Self {
            config,
            tasks,
            connections,
            credentials,
            listener,
            shared: Arc::new(Shared {
                phase: AtomicPhase::new(ScanPhase::Idle),
                scanning: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                tokens: Mutex::new(Vec::new()),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Orchestrator configuration.
    #[must_use]
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// The connection pool used for remote roots.
    #[must_use]
    pub fn connection_pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.connections
    }

    /// Current pipeline phase.
    #[must_use]
    pub fn phase(&self) -> ScanPhase {
        self.shared.phase.load()
    }

    /// Whether a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    /// Start scanning `roots` in `mode`.
    ///
    /// Returns [`StartStatus::AlreadyRunning`] without side effects while a
    /// scan is in progress. Listener callbacks run before the scan is marked
    /// finished, so a listener cannot start the next scan from inside them.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Spawn`] if the driver thread cannot be
    /// created.
    pub fn start_scan(
        &self,
        roots: Vec<ScanRoot>,
        mode: SpeedMode,
    ) -> Result<StartStatus, OrchestratorError> {
        // Held until the driver is stored so stop_scan cannot interleave
        // with the reset of the stop flag
        let mut driver = lock_unpoisoned(&self.driver);
        if self
            .shared
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("A scan is already running; start request ignored");
            return Ok(StartStatus::AlreadyRunning);
        }

        // Reap the previous driver, which has finished by now
        if let Some(previous) = driver.take() {
            let _ = previous.join();
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        lock_unpoisoned(&self.shared.tokens).clear();
        self.shared.phase.store(ScanPhase::Idle);

        let run = ScanRun {
            config: self.config.clone(),
            tasks: Arc::clone(&self.tasks),
            connections: Arc::clone(&self.connections),
            credentials: Arc::clone(&self.credentials),
            listener: Arc::clone(&self.listener),
            shared: Arc::clone(&self.shared),
            roots,
            mode,
        };

        log::info!("Starting {} scan of {} root(s)", mode, run.roots.len());
        let spawned = thread::Builder::new()
            .name("netdupe-scan".to_string())
            .spawn(move || run.execute());
        match spawned {
            Ok(handle) => {
                *driver = Some(handle);
                Ok(StartStatus::Started)
            }
            Err(e) => {
                self.shared.scanning.store(false, Ordering::SeqCst);
                Err(OrchestratorError::Spawn(e))
            }
        }
    }

    /// Request cooperative cancellation of the running scan.
    ///
    /// Queued work is dropped at once; running tasks finish on their own and
    /// the scan ends in [`ScanPhase::Cancelled`] without a completion event.
    pub fn stop_scan(&self) {
        let _driver = lock_unpoisoned(&self.driver);
        if !self.is_scanning() {
            return;
        }
        log::info!("Stop requested");
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.cancel_all();
        let dropped = self.tasks.clear_pending();
        if dropped > 0 {
            log::debug!("Dropped {} queued tasks", dropped);
        }
    }

    /// Wait for the current scan to end and return its final phase.
    ///
    /// Returns `None` if no scan was started since the last wait.
    pub fn wait(&self) -> Option<ScanPhase> {
        let handle = lock_unpoisoned(&self.driver).take()?;
        match handle.join() {
            Ok(phase) => Some(phase),
            Err(_) => {
                log::error!("Scan driver thread panicked");
                self.shared.phase.store(ScanPhase::Failed);
                self.shared.scanning.store(false, Ordering::SeqCst);
                Some(ScanPhase::Failed)
            }
        }
    }
}

impl<C: Connector> Drop for ScanOrchestrator<C> {
    fn drop(&mut self) {
        self.stop_scan();
        let _ = self.wait();
    }
}

/// Everything one scan needs, owned by the driver thread.
struct ScanRun<C: Connector> {
    config: ScanConfig,
    tasks: Arc<TaskPool>,
    connections: Arc<ConnectionPool<C>>,
    credentials: Arc<dyn CredentialProvider>,
    listener: Arc<dyn ScanListener>,
    shared: Arc<Shared>,
    roots: Vec<ScanRoot>,
    mode: SpeedMode,
}

type Multiplexer<C> = ListingMultiplexer<PooledTransfers<C>>;

impl<C: Connector> ScanRun<C> {
    fn execute(self) -> ScanPhase {
        self.listener.on_scan_started();

        let phase = match self.run_pipeline() {
            Ok(Some(result)) => {
                log::info!(
                    "Scan complete: {} duplicate groups, {} reclaimable",
                    result.groups.len(),
                    ByteSize(result.wasted_space())
                );
                self.set_phase(ScanPhase::Completed);
                self.listener.on_completed(&result);
                ScanPhase::Completed
            }
            Ok(None) => {
                self.set_phase(ScanPhase::Cancelled);
                ScanPhase::Cancelled
            }
            Err(e) => {
                log::error!("Scan failed: {}", e);
                self.set_phase(ScanPhase::Failed);
                self.listener.on_failed(&e.to_string());
                ScanPhase::Failed
            }
        };

        self.shared.scanning.store(false, Ordering::SeqCst);
        phase
    }

    fn set_phase(&self, phase: ScanPhase) {
        self.shared.phase.store(phase);
        log::info!("Phase: {}", phase);
        self.listener.on_phase_changed(phase);
    }

    fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    fn report(&self, error: &ScanError, stats: &mut ScanStats, root_errors: &mut Vec<String>) {
        stats.roots_failed += 1;
        root_errors.push(error.to_string());
        self.listener.on_error(error);
    }

    /// Cancel everything in flight and wait for running tasks to return.
    fn abort(&self, latch: &CompletionLatch, mux: Option<&mut Multiplexer<C>>) {
        self.shared.cancel_all();
        let dropped = self.tasks.clear_pending();
        if let Some(mux) = mux {
            mux.cancel_all();
        }
        latch.wait();
        log::info!("Scan cancelled ({} queued tasks dropped)", dropped);
    }

    fn run_pipeline(&self) -> Result<Option<ScanResult>, OrchestratorError> {
        let started = Instant::now();
        let mut stats = ScanStats::default();
        let mut root_errors = Vec::new();

        // Phase 1: collection
        self.set_phase(ScanPhase::Collecting);
        let Some(table) = self.collect(&mut stats, &mut root_errors)? else {
            return Ok(None);
        };

        // Phase 2: size filtering
        self.set_phase(ScanPhase::SizeFiltering);
        let sizes = table.take();
        stats.files_collected = sizes.len();
        let (buckets, size_stats) = group_by_size(&sizes, self.config.min_size);
        stats.candidates = size_stats.candidates;

        let candidates: Vec<(Location, u64)> = buckets
            .into_iter()
            .flat_map(|bucket| {
                let size = bucket.size;
                bucket.members.into_iter().map(move |m| (m, size))
            })
            .collect();

        // Phases 3 and 4: hashing
        let mut groups = if candidates.is_empty() {
            log::info!("No files share a size; skipping hashing");
            Vec::new()
        } else {
            match self.hash_candidates(candidates, &sizes, &mut stats)? {
                Some(groups) => groups,
                None => return Ok(None),
            }
        };

        // Phase 5: comparison
        self.set_phase(ScanPhase::Comparing);
        self.config.keep_policy.apply(&mut groups);
        stats.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok(Some(ScanResult {
            mode: self.mode,
            groups,
            sizes: sizes.into_iter().collect(),
            stats,
            root_errors,
        }))
    }

    fn collect(
        &self,
        stats: &mut ScanStats,
        root_errors: &mut Vec<String>,
    ) -> Result<Option<Arc<CollectionTable>>, OrchestratorError> {
        let table = Arc::new(CollectionTable::new());
        let latch = CompletionLatch::new();
        let (error_tx, error_rx) = unbounded::<ScanError>();
        let local_config = LocalCollectorConfig::default()
            .with_exclude_patterns(self.config.exclude_patterns.clone());

        let remote_roots: Vec<(&ScanRoot, &RemoteLocator)> = self
            .roots
            .iter()
            .filter_map(|root| match root {
                ScanRoot::Remote(locator) => Some((root, locator)),
                ScanRoot::Local(_) => None,
            })
            .collect();

        let mut collector = RemoteCollector::new(self.config.remote.clone());
        let mut mux: Option<Multiplexer<C>> = None;
        if !remote_roots.is_empty() {
            match PooledTransfers::new(Arc::clone(&self.connections), self.config.transfer_connections)
            {
                Ok(engine) => {
                    mux = Some(ListingMultiplexer::new(engine, self.config.multiplexer.clone()));
                }
                Err(e) => {
                    for (root, _) in &remote_roots {
                        let error = ScanError::RootUnreachable {
                            root: root.to_string(),
                            reason: e.to_string(),
                        };
                        self.report(&error, stats, root_errors);
                    }
                }
            }
        }

        for root in &self.roots {
            match root {
                ScanRoot::Local(path) => {
                    self.spawn_local(path.clone(), &local_config, &table, &latch, &error_tx)?;
                }
                ScanRoot::Remote(locator) if mux.is_some() => match self.remote_target(locator) {
                    Ok(target) => collector.add_root(root.to_string(), locator.clone(), target),
                    Err(error) => self.report(&error, stats, root_errors),
                },
                ScanRoot::Remote(_) => {}
            }
        }

        let interval = self.config.progress_interval;
        let tick = self.config.multiplexer.tick;
        let started = Instant::now();
        let mut last_report = Instant::now();

        loop {
            if self.stop_requested() {
                self.abort(&latch, mux.as_mut());
                return Ok(None);
            }

            if let Some(mux) = mux.as_mut() {
                for error in collector.pump(mux, &table) {
                    self.report(&error, stats, root_errors);
                }
            }
            for error in error_rx.try_iter() {
                self.report(&error, stats, root_errors);
            }

            if latch.outstanding() == 0 && collector.is_idle() {
                break;
            }

            let wait = if collector.is_idle() { interval } else { tick };
            if latch.outstanding() == 0 {
                thread::sleep(wait);
            } else {
                latch.wait_timeout(wait);
            }

            if last_report.elapsed() >= interval {
                let collected = table.len();
                self.listener.on_progress(collected, 0, 0.0);
                self.listener
                    .on_speed(rate(collected, started.elapsed()), self.tasks.active_count());
                last_report = Instant::now();
            }
        }

        // Errors sent by the last local tasks
        for error in error_rx.try_iter() {
            self.report(&error, stats, root_errors);
        }
        if let Some(mut mux) = mux {
            // Drops requests of roots abandoned by the watchdog
            mux.cancel_all();
        }

        let remote = collector.summary();
        stats.directories_failed = remote.directories_failed;
        stats.unparseable_lines = remote.unparseable_lines;
        log::info!(
            "Collection complete: {} files ({} remote)",
            table.len(),
            remote.files
        );
        Ok(Some(table))
    }

    fn spawn_local(
        &self,
        path: std::path::PathBuf,
        config: &LocalCollectorConfig,
        table: &Arc<CollectionTable>,
        latch: &CompletionLatch,
        errors: &Sender<ScanError>,
    ) -> Result<(), OrchestratorError> {
        let guard = latch.guard();
        let table = Arc::clone(table);
        let errors = errors.clone();
        let config = config.clone();

        let token = self.tasks.enqueue_cancellable(move |token| {
            let _guard = guard;
            match collect_local(&path, &config, &table, token) {
                Ok(summary) => log::debug!(
                    "Local root {} done: {} files",
                    path.display(),
                    summary.files
                ),
                Err(e) => {
                    log::warn!("{}", e);
                    let _ = errors.send(e);
                }
            }
        })?;
        self.shared.track(token);
        Ok(())
    }

    fn remote_target(&self, locator: &RemoteLocator) -> Result<ListingTarget, ScanError> {
        let connector = self.connections.connector();
        if connector.scheme() != locator.scheme {
            return Err(ScanError::UnsupportedRoot {
                root: locator.to_string(),
                scheme: locator.scheme.clone(),
            });
        }

        let embedded = locator.username.as_ref().map(|user| {
            Credentials::new(user.clone(), locator.password.clone().unwrap_or_default())
        });
        let credentials = resolve_credentials(
            embedded,
            self.credentials.as_ref(),
            &locator.host,
            locator.port,
            connector.allows_anonymous(),
        )
        .ok_or_else(|| ScanError::MissingCredentials(locator.to_string()))?;

        Ok(ListingTarget::new(
            locator.scheme.clone(),
            ConnectionInfo::new(locator.host.clone(), locator.port, credentials),
        ))
    }

    fn hash_candidates(
        &self,
        candidates: Vec<(Location, u64)>,
        sizes: &HashMap<Location, u64>,
        stats: &mut ScanStats,
    ) -> Result<Option<Vec<DuplicateGroup>>, OrchestratorError> {
        let full_hasher = Hasher::new(0);

        if !self.mode.uses_quick_hash() {
            self.set_phase(ScanPhase::FullHashing);
            let Some(full) = self.hash_phase(candidates, FULL_BATCH_MIN, stats, move |loc, _, token| {
                full_hasher.full_hash(loc, Some(token))
            })?
            else {
                return Ok(None);
            };
            stats.full_hashed = full.len();
            return Ok(Some(group_by_hash(&full, sizes, HashValue::Full)));
        }

        self.set_phase(ScanPhase::QuickHashing);
        let quick_hasher = Hasher::new(self.mode.quick_chunk_size());
        let Some(quick) = self.hash_phase(candidates, QUICK_BATCH_MIN, stats, move |loc, size, _| {
            quick_hasher.quick_hash(loc, size)
        })?
        else {
            return Ok(None);
        };
        stats.quick_hashed = quick.len();
        let quick_groups = group_by_hash(&quick, sizes, HashValue::Quick);

        if !self.config.confirm_quick_collisions || quick_groups.is_empty() {
            return Ok(Some(quick_groups));
        }

        self.set_phase(ScanPhase::FullHashing);
        let colliding: Vec<(Location, u64)> = quick_groups
            .into_iter()
            .flat_map(|group| {
                let size = group.size;
                group.members.into_iter().map(move |m| (m, size))
            })
            .collect();
        let Some(full) = self.hash_phase(colliding, FULL_BATCH_MIN, stats, move |loc, _, token| {
            full_hasher.full_hash(loc, Some(token))
        })?
        else {
            return Ok(None);
        };
        stats.full_hashed = full.len();
        Ok(Some(group_by_hash(&full, sizes, HashValue::Full)))
    }

    /// Hash `files` in batches on the task pool.
    ///
    /// Returns `None` if the scan was stopped.
    fn hash_phase<T, F>(
        &self,
        files: Vec<(Location, u64)>,
        min_batch: usize,
        stats: &mut ScanStats,
        hash: F,
    ) -> Result<Option<HashMap<Location, T>>, OrchestratorError>
    where
        T: Send + 'static,
        F: Fn(&Location, u64, &CancelToken) -> Result<T, HashError> + Send + Sync + 'static,
    {
        let total = files.len();
        let batch_size = (total / self.tasks.size().max(1)).max(min_batch);
        let records: Arc<Mutex<HashMap<Location, T>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(total)));
        let processed = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let hash = Arc::new(hash);
        let latch = CompletionLatch::new();

        let mut files = files.into_iter().peekable();
        while files.peek().is_some() {
            let batch: Vec<(Location, u64)> = files.by_ref().take(batch_size).collect();
            let guard = latch.guard();
            let records = Arc::clone(&records);
            let processed = Arc::clone(&processed);
            let failures = Arc::clone(&failures);
            let hash = Arc::clone(&hash);

            let token = self.tasks.enqueue_cancellable(move |token| {
                let _guard = guard;
                let mut done = Vec::with_capacity(batch.len());
                for (location, size) in batch {
                    if token.is_cancelled() {
                        break;
                    }
                    match hash(&location, size, token) {
                        Ok(value) => done.push((location, value)),
                        Err(HashError::Cancelled) => break,
                        Err(e) => {
                            log::warn!("Skipping {}: {}", location, e);
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    processed.fetch_add(1, Ordering::Relaxed);
                }
                lock_unpoisoned(&records).extend(done);
            })?;
            self.shared.track(token);
        }

        let started = Instant::now();
        loop {
            if self.stop_requested() {
                self.abort(&latch, None);
                return Ok(None);
            }
            let finished = latch.wait_timeout(self.config.progress_interval);
            let done = processed.load(Ordering::Relaxed);
            self.listener.on_progress(done, total, percent(done, total));
            self.listener
                .on_speed(rate(done, started.elapsed()), self.tasks.active_count());
            if finished {
                break;
            }
        }

        stats.hash_failures += failures.load(Ordering::Relaxed);
        let records = std::mem::take(&mut *lock_unpoisoned(&records));
        Ok(Some(records))
    }
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        (done as f64 / total as f64) * 100.0
    }
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duplicates::events::{ChannelListener, ScanEvent};
    use crate::remote::memory::{MemoryConnector, MemoryServer};
    use crate::remote::{NoCredentials, PoolConfig};
    use crossbeam_channel::Receiver;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        orchestrator: ScanOrchestrator<MemoryConnector>,
        events: Receiver<ScanEvent>,
        tasks: Arc<TaskPool>,
    }

    fn fixture(server: &MemoryServer, config: ScanConfig) -> Fixture {
        let tasks = Arc::new(TaskPool::new(4).unwrap());
        let connections = Arc::new(ConnectionPool::new(
            MemoryConnector::new(server.clone()),
            PoolConfig::default(),
        ));
        let (listener, events) = ChannelListener::channel();
        let orchestrator = ScanOrchestrator::new(
            config,
            Arc::clone(&tasks),
            connections,
            Arc::new(NoCredentials),
            Arc::new(listener),
        );
        Fixture {
            orchestrator,
            events,
            tasks,
        }
    }

    fn completed(events: &Receiver<ScanEvent>) -> Option<ScanResult> {
        events.try_iter().find_map(|event| match event {
            ScanEvent::Completed(result) => Some(*result),
            _ => None,
        })
    }

    fn local_root(dir: &TempDir) -> ScanRoot {
        ScanRoot::Local(dir.path().to_path_buf())
    }

    #[test]
    fn test_finds_duplicates_in_every_mode() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), vec![b'x'; 100]).unwrap();
        fs::write(dir.path().join("b"), vec![b'x'; 100]).unwrap();
        fs::write(dir.path().join("c"), vec![b'y'; 50]).unwrap();

        for mode in [SpeedMode::Turbo, SpeedMode::Balanced, SpeedMode::Accurate] {
            let fx = fixture(&MemoryServer::new(), ScanConfig::default());
            let status = fx.orchestrator.start_scan(vec![local_root(&dir)], mode).unwrap();
            assert_eq!(status, StartStatus::Started);
            assert_eq!(fx.orchestrator.wait(), Some(ScanPhase::Completed));

            let result = completed(&fx.events).expect("completed event");
            assert_eq!(result.groups.len(), 1, "mode {mode}");
            assert_eq!(result.groups[0].len(), 2);
            assert_eq!(result.groups[0].hash.is_full(), mode == SpeedMode::Accurate);
            assert_eq!(result.sizes.len(), 3);
        }
    }

    #[test]
    fn test_distinct_sizes_skip_hashing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), b"1").unwrap();
        fs::write(dir.path().join("b"), b"22").unwrap();
        fs::write(dir.path().join("c"), b"333").unwrap();

        let fx = fixture(&MemoryServer::new(), ScanConfig::default());
        fx.orchestrator
            .start_scan(vec![local_root(&dir)], SpeedMode::Balanced)
            .unwrap();
        fx.orchestrator.wait();

        let events: Vec<ScanEvent> = fx.events.try_iter().collect();
        assert!(!events
            .iter()
            .any(|e| matches!(e, ScanEvent::PhaseChanged(ScanPhase::QuickHashing))));
        let result = events
            .into_iter()
            .find_map(|e| match e {
                ScanEvent::Completed(r) => Some(r),
                _ => None,
            })
            .unwrap();
        assert!(result.groups.is_empty());
        assert_eq!(result.stats.quick_hashed, 0);
        assert_eq!(result.stats.files_collected, 3);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let server = MemoryServer::new();
        server.set_list_delay(Duration::from_millis(200));
        let fx = fixture(&server, ScanConfig::default());
        let root = ScanRoot::parse("ftp://mem/").unwrap();

        assert_eq!(
            fx.orchestrator.start_scan(vec![root.clone()], SpeedMode::Turbo).unwrap(),
            StartStatus::Started
        );
        assert_eq!(
            fx.orchestrator.start_scan(vec![root], SpeedMode::Turbo).unwrap(),
            StartStatus::AlreadyRunning
        );
        fx.orchestrator.wait();
        assert!(!fx.orchestrator.is_scanning());
    }

    #[test]
    fn test_stop_racing_start_is_honored() {
        let server = MemoryServer::new();
        server.set_list_delay(Duration::from_millis(200));
        let fx = fixture(&server, ScanConfig::default());
        let orchestrator = &fx.orchestrator;
        let root = ScanRoot::parse("ftp://mem/").unwrap();

        for _ in 0..20 {
            thread::scope(|scope| {
                scope.spawn(|| {
                    // Stop as soon as the scan flag flips, while start_scan
                    // may still be setting up
                    while !orchestrator.is_scanning() {
                        thread::yield_now();
                    }
                    orchestrator.stop_scan();
                });
                orchestrator
                    .start_scan(vec![root.clone()], SpeedMode::Turbo)
                    .unwrap();
            });
            assert_eq!(orchestrator.wait(), Some(ScanPhase::Cancelled));
        }
        assert!(completed(&fx.events).is_none());
    }

    #[test]
    fn test_stop_during_collection_cancels() {
        let server = MemoryServer::new();
        server.set_list_delay(Duration::from_millis(300));
        let fx = fixture(&server, ScanConfig::default());
        fx.orchestrator
            .start_scan(vec![ScanRoot::parse("ftp://mem/").unwrap()], SpeedMode::Balanced)
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        fx.orchestrator.stop_scan();
        assert_eq!(fx.orchestrator.wait(), Some(ScanPhase::Cancelled));
        assert_eq!(fx.orchestrator.phase(), ScanPhase::Cancelled);
        assert!(completed(&fx.events).is_none());
        assert_eq!(fx.tasks.pending_count(), 0);
    }

    #[test]
    fn test_unreachable_remote_root_does_not_fail_scan() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), b"same").unwrap();
        fs::write(dir.path().join("b"), b"same").unwrap();

        let server = MemoryServer::new();
        server.set_reachable(false);
        let config = ScanConfig::default().with_multiplexer(MultiplexerConfig {
            max_backoff: Duration::from_millis(5),
            ..MultiplexerConfig::default()
        });
        let fx = fixture(&server, config);
        fx.orchestrator
            .start_scan(
                vec![ScanRoot::parse("ftp://mem/").unwrap(), local_root(&dir)],
                SpeedMode::Accurate,
            )
            .unwrap();
        assert_eq!(fx.orchestrator.wait(), Some(ScanPhase::Completed));

        let events: Vec<ScanEvent> = fx.events.try_iter().collect();
        let errors: Vec<&ScanError> = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Error(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ScanError::RootUnreachable { .. }));

        let result = events
            .iter()
            .find_map(|e| match e {
                ScanEvent::Completed(r) => Some(r),
                _ => None,
            })
            .unwrap();
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.stats.roots_failed, 1);
    }

    #[test]
    fn test_missing_credentials_without_anonymous() {
        let tasks = Arc::new(TaskPool::new(2).unwrap());
        let connections = Arc::new(ConnectionPool::new(
            MemoryConnector::new(MemoryServer::new()).with_anonymous(false),
            PoolConfig::default(),
        ));
        let (listener, events) = ChannelListener::channel();
        let orchestrator = ScanOrchestrator::new(
            ScanConfig::default(),
            tasks,
            connections,
            Arc::new(NoCredentials),
            Arc::new(listener),
        );
        orchestrator
            .start_scan(vec![ScanRoot::parse("ftp://mem/").unwrap()], SpeedMode::Turbo)
            .unwrap();
        assert_eq!(orchestrator.wait(), Some(ScanPhase::Completed));
        assert!(events
            .try_iter()
            .any(|e| matches!(e, ScanEvent::Error(ScanError::MissingCredentials(_)))));
    }

    #[test]
    fn test_unsupported_scheme_is_reported() {
        let fx = fixture(&MemoryServer::new(), ScanConfig::default());
        fx.orchestrator
            .start_scan(
                vec![ScanRoot::parse("sftp://host:22/data").unwrap()],
                SpeedMode::Turbo,
            )
            .unwrap();
        fx.orchestrator.wait();
        assert!(fx
            .events
            .try_iter()
            .any(|e| matches!(e, ScanEvent::Error(ScanError::UnsupportedRoot { .. }))));
    }

    #[test]
    fn test_remote_files_take_part_in_size_filtering() {
        let server = MemoryServer::new();
        server.add_file("/x/a.bin", 10);
        server.add_file("/y/a.bin", 10);
        server.add_file("/y/b.bin", 20);

        let fx = fixture(&server, ScanConfig::default());
        fx.orchestrator
            .start_scan(vec![ScanRoot::parse("ftp://mem/").unwrap()], SpeedMode::Turbo)
            .unwrap();
        fx.orchestrator.wait();

        let result = completed(&fx.events).unwrap();
        assert_eq!(result.stats.files_collected, 3);
        assert_eq!(result.stats.candidates, 2);
        // Remote content cannot be hashed
        assert_eq!(result.stats.hash_failures, 2);
        assert!(result.groups.is_empty());
    }

    #[test]
    fn test_keep_policy_marks_canonical() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("deep")).unwrap();
        fs::write(dir.path().join("a"), b"dup").unwrap();
        fs::write(dir.path().join("deep").join("a"), b"dup").unwrap();

        let config = ScanConfig::default().with_keep_policy(KeepPolicy::ShortestPath);
        let fx = fixture(&MemoryServer::new(), config);
        fx.orchestrator
            .start_scan(vec![local_root(&dir)], SpeedMode::Accurate)
            .unwrap();
        fx.orchestrator.wait();

        let result = completed(&fx.events).unwrap();
        let keep = result.groups[0].canonical().unwrap();
        assert_eq!(keep, &Location::Local(dir.path().join("a")));
    }

    #[test]
    fn test_confirmation_splits_quick_hash_collisions() {
        let dir = TempDir::new().unwrap();
        // Same head, tail and size; differ only in the middle
        let mut a = vec![0u8; 64 * 1024];
        let b = a.clone();
        a[32 * 1024] = 1;
        fs::write(dir.path().join("a"), &a).unwrap();
        fs::write(dir.path().join("b"), &b).unwrap();

        let fx = fixture(&MemoryServer::new(), ScanConfig::default());
        fx.orchestrator
            .start_scan(vec![local_root(&dir)], SpeedMode::Turbo)
            .unwrap();
        fx.orchestrator.wait();
        assert_eq!(completed(&fx.events).unwrap().groups.len(), 1);

        let config = ScanConfig::default().with_confirm_quick_collisions(true);
        let fx = fixture(&MemoryServer::new(), config);
        fx.orchestrator
            .start_scan(vec![local_root(&dir)], SpeedMode::Turbo)
            .unwrap();
        fx.orchestrator.wait();
        let result = completed(&fx.events).unwrap();
        assert!(result.groups.is_empty());
        assert_eq!(result.stats.full_hashed, 2);
    }

    #[test]
    fn test_phase_sequence() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), b"same").unwrap();
        fs::write(dir.path().join("b"), b"same").unwrap();

        let fx = fixture(&MemoryServer::new(), ScanConfig::default());
        fx.orchestrator
            .start_scan(vec![local_root(&dir)], SpeedMode::Balanced)
            .unwrap();
        fx.orchestrator.wait();

        let phases: Vec<ScanPhase> = fx
            .events
            .try_iter()
            .filter_map(|e| match e {
                ScanEvent::PhaseChanged(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                ScanPhase::Collecting,
                ScanPhase::SizeFiltering,
                ScanPhase::QuickHashing,
                ScanPhase::Comparing,
                ScanPhase::Completed,
            ]
        );
    }
}
