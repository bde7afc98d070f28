//! Remote directory collection.
//!
//! [`RemoteCollector`] walks remote roots breadth-first through a
//! [`ListingMultiplexer`]. Every completed listing is parsed; files go into the
//! [`CollectionTable`] with their reported size and subdirectories are queued
//! as new listing requests, up to a depth limit. Requests are only handed to
//! the multiplexer while it has fewer than `max_outstanding` in flight.
//!
//! Failure is tracked per root:
//! - the root listing itself failing aborts that root ([`ScanError::RootUnreachable`])
//! - a subdirectory failing is counted and skipped
//! - a root with no completion within the watchdog period is aborted
//!   ([`ScanError::WatchdogExpired`]); the period only runs while the root
//!   has a request held by the transfer engine

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::{CollectionTable, FileEntry, Location, ScanError};
use crate::remote::listing::{parse_listing, EntryKind};
use crate::remote::locator::join_remote;
use crate::remote::{ListingCompletion, ListingMultiplexer, ListingTarget, MultiTransfer, RemoteLocator};

/// Traversal limits for remote roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCollectorConfig {
    /// Deepest subdirectory level listed; the root is level 0 (default: 10)
    pub max_depth: usize,
    /// Listing requests kept in flight at most (default: 300)
    pub max_outstanding: usize,
    /// Time a root may go without any completed listing (default: 300 s)
    pub watchdog: Duration,
}

impl Default for RemoteCollectorConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_outstanding: 300,
            watchdog: Duration::from_secs(300),
        }
    }
}

/// Counters from remote collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteSummary {
    /// Files added to the table
    pub files: usize,
    /// Directory listings that completed successfully
    pub directories_listed: usize,
    /// Subdirectory listings that failed
    pub directories_failed: usize,
    /// Listing lines matching no known format
    pub unparseable_lines: usize,
    /// Files skipped because the listing carried no size
    pub sizeless_files: usize,
}

#[derive(Debug)]
struct RootState {
    label: String,
    locator: RemoteLocator,
    target: ListingTarget,
    last_progress: Instant,
    failed: bool,
}

#[derive(Debug, Clone)]
struct DirRequest {
    root: usize,
    directory: String,
    depth: usize,
}

/// Breadth-first collector for remote roots.
#[derive(Debug)]
pub struct RemoteCollector {
    config: RemoteCollectorConfig,
    roots: Vec<RootState>,
    queued: VecDeque<DirRequest>,
    in_flight: HashMap<u64, DirRequest>,
    next_request: u64,
    summary: RemoteSummary,
}

impl RemoteCollector {
    /// Create a collector with no roots.
    #[must_use]
    pub fn new(config: RemoteCollectorConfig) -> Self {
        Self {
            config,
            roots: Vec::new(),
            queued: VecDeque::new(),
            in_flight: HashMap::new(),
            next_request: 0,
            summary: RemoteSummary::default(),
        }
    }

    /// Add a root to traverse.
    ///
    /// `label` is the root as the user gave it, used in error reports.
    pub fn add_root(&mut self, label: impl Into<String>, locator: RemoteLocator, target: ListingTarget) {
        let index = self.roots.len();
        self.queued.push_back(DirRequest {
            root: index,
            directory: locator.path.clone(),
            depth: 0,
        });
        self.roots.push(RootState {
            label: label.into(),
            locator,
            target,
            last_progress: Instant::now(),
            failed: false,
        });
    }

    /// Number of roots added.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Whether every root finished or failed.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty()
    }

    /// Counters so far.
    #[must_use]
    pub fn summary(&self) -> RemoteSummary {
        self.summary
    }

    /// Advance collection by one multiplexer step.
    ///
    /// Handles finished listings, tops the multiplexer up with queued
    /// directories and applies the watchdog. Returns the roots that failed
    /// during this call.
    pub fn pump<M: MultiTransfer>(
        &mut self,
        mux: &mut ListingMultiplexer<M>,
        table: &CollectionTable,
    ) -> Vec<ScanError> {
        let mut errors = Vec::new();

        for completion in mux.step() {
            if let Some(err) = self.handle_completion(completion, table) {
                errors.push(err);
            }
        }

        while mux.active_requests() < self.config.max_outstanding {
            let Some(request) = self.queued.pop_front() else {
                break;
            };
            if self.roots[request.root].failed {
                continue;
            }
            let id = self.next_request;
            self.next_request += 1;
            mux.add_request(&self.roots[request.root].target, &request.directory, id);
            self.in_flight.insert(id, request);
        }

        errors.extend(self.check_watchdog(&mux.dispatched_request_ids()));
        errors
    }

    fn handle_completion(
        &mut self,
        completion: ListingCompletion,
        table: &CollectionTable,
    ) -> Option<ScanError> {
        // Unknown ids belong to roots already abandoned
        let request = self.in_flight.remove(&completion.request_id)?;
        let root = &mut self.roots[request.root];
        if root.failed {
            return None;
        }
        root.last_progress = Instant::now();

        if !completion.success {
            let reason = completion
                .error
                .unwrap_or_else(|| "listing failed".to_string());
            if request.depth == 0 {
                return Some(self.fail_root(request.root, |label| ScanError::RootUnreachable {
                    root: label,
                    reason,
                }));
            }
            log::warn!(
                "Skipping {}: {}",
                root.locator.directory_url(&request.directory),
                reason
            );
            self.summary.directories_failed += 1;
            return None;
        }

        self.summary.directories_listed += 1;
        let (entries, unparseable) = parse_listing(completion.lines.iter().map(String::as_str));
        self.summary.unparseable_lines += unparseable;

        let mut batch = Vec::new();
        for entry in entries {
            match entry.kind {
                EntryKind::Directory => {
                    let depth = request.depth + 1;
                    if depth > self.config.max_depth {
                        log::debug!(
                            "Depth limit reached, not descending into {}",
                            join_remote(&request.directory, &entry.name)
                        );
                        continue;
                    }
                    self.queued.push_back(DirRequest {
                        root: request.root,
                        directory: join_remote(&request.directory, &entry.name),
                        depth,
                    });
                }
                EntryKind::File => match entry.size {
                    Some(size) => batch.push(FileEntry::new(
                        Location::Remote(root.locator.file_url(&request.directory, &entry.name)),
                        size,
                    )),
                    None => self.summary.sizeless_files += 1,
                },
                EntryKind::Symlink => {
                    log::trace!("Skipping symlink {}", entry.name);
                }
            }
        }
        self.summary.files += table.insert_batch(batch);
        None
    }

    fn check_watchdog(&mut self, dispatched: &HashSet<u64>) -> Vec<ScanError> {
        let watchdog = self.config.watchdog;
        let mut active = vec![false; self.roots.len()];
        for (id, request) in &self.in_flight {
            if dispatched.contains(id) {
                active[request.root] = true;
            }
        }

        // Waiting behind other roots' listings is not a stall
        let now = Instant::now();
        for (root, dispatched) in self.roots.iter_mut().zip(&active) {
            if !dispatched {
                root.last_progress = now;
            }
        }

        let stalled: Vec<usize> = self
            .roots
            .iter()
            .enumerate()
            .filter(|(i, root)| active[*i] && !root.failed && root.last_progress.elapsed() > watchdog)
            .map(|(i, _)| i)
            .collect();

        stalled
            .into_iter()
            .map(|index| {
                self.fail_root(index, |label| ScanError::WatchdogExpired {
                    root: label,
                    after: watchdog,
                })
            })
            .collect()
    }

    fn fail_root(&mut self, index: usize, make: impl FnOnce(String) -> ScanError) -> ScanError {
        let root = &mut self.roots[index];
        root.failed = true;
        self.queued.retain(|r| r.root != index);
        self.in_flight.retain(|_, r| r.root != index);
        let err = make(root.label.clone());
        log::warn!("{}", err);
        err
    }
}
