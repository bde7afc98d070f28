//! Listing multiplexer.
//!
//! Drives many concurrent directory-listing requests through one
//! [`MultiTransfer`] engine. The owner calls [`ListingMultiplexer::step`] on a
//! fixed tick; each step advances the engine, applies per-request timeouts,
//! schedules retries, and returns the requests that finished since the last
//! step. `step` never blocks on network I/O.
//!
//! Requests beyond the engine's [`capacity`](MultiTransfer::capacity) wait in
//! the multiplexer and are handed over as transfers finish. A request's
//! deadline starts when it is handed to the engine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use super::connection::{ConnectionInfo, TransportError};
use super::locator::directory_url;
use super::transfer::{MultiTransfer, TransferDone, TransferRequest};

/// Where a listing request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingTarget {
    /// URL scheme used to build listing URLs
    pub scheme: String,
    /// Server and identity
    pub info: ConnectionInfo,
}

impl ListingTarget {
    /// Create a target.
    #[must_use]
    pub fn new(scheme: impl Into<String>, info: ConnectionInfo) -> Self {
        Self {
            scheme: scheme.into(),
            info,
        }
    }
}

/// A finished listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingCompletion {
    /// Identifier given to [`ListingMultiplexer::add_request`]
    pub request_id: u64,
    /// Directory that was listed
    pub directory: String,
    /// Trimmed, non-empty listing lines (empty on failure)
    pub lines: Vec<String>,
    /// Whether the listing succeeded
    pub success: bool,
    /// Failure description when `success` is false
    pub error: Option<String>,
}

impl ListingCompletion {
    fn failed(request_id: u64, directory: String, error: String) -> Self {
        Self {
            request_id,
            directory,
            lines: Vec::new(),
            success: false,
            error: Some(error),
        }
    }
}

/// Timing and retry policy for the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerConfig {
    /// Interval between steps when driven by [`ListingMultiplexer::run_until_idle`]
    pub tick: Duration,
    /// Per-request deadline (default: 30 s)
    pub request_timeout: Duration,
    /// Retry retryable connection failures
    pub auto_reconnect: bool,
    /// Maximum retries per request
    pub retry_budget: u32,
    /// Upper bound on the retry backoff
    pub max_backoff: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            request_timeout: Duration::from_secs(30),
            auto_reconnect: true,
            retry_budget: 3,
            max_backoff: Duration::from_millis(5000),
        }
    }
}

impl MultiplexerConfig {
    /// Backoff before retry number `attempt` (0-based): `100ms * 2^attempt`,
    /// capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let millis = 100u64.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(millis).min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    request_id: u64,
    target: ListingTarget,
    directory: String,
    url: String,
    attempts: u32,
    started: Instant,
}

/// Multiplexes directory listings over a [`MultiTransfer`] engine.
pub struct ListingMultiplexer<M: MultiTransfer> {
    engine: M,
    config: MultiplexerConfig,
    next_token: u64,
    waiting: VecDeque<PendingRequest>,
    in_flight: HashMap<u64, PendingRequest>,
    retry_queue: VecDeque<(Instant, PendingRequest)>,
    ready: Vec<ListingCompletion>,
    timed_out: u64,
    retried: u64,
}

impl<M: MultiTransfer> ListingMultiplexer<M> {
    /// Create a multiplexer over `engine`.
    #[must_use]
    pub fn new(engine: M, config: MultiplexerConfig) -> Self {
        Self {
            engine,
            config,
            next_token: 0,
            waiting: VecDeque::new(),
            in_flight: HashMap::new(),
            retry_queue: VecDeque::new(),
            ready: Vec::new(),
            timed_out: 0,
            retried: 0,
        }
    }

    /// Multiplexer configuration.
    #[must_use]
    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Queue a listing of `directory` on `target`.
    ///
    /// The request is handed to the engine at once if it has a free slot.
    /// If the engine refuses the transfer, a failed completion for
    /// `request_id` is returned by the next [`step`](Self::step).
    pub fn add_request(&mut self, target: &ListingTarget, directory: &str, request_id: u64) {
        let url = directory_url(
            &target.scheme,
            &target.info.host,
            target.info.port,
            directory,
        );
        let pending = PendingRequest {
            request_id,
            target: target.clone(),
            directory: directory.to_string(),
            url,
            attempts: 0,
            started: Instant::now(),
        };
        self.waiting.push_back(pending);
        self.dispatch();
    }

    /// Hand waiting requests to the engine while it has free slots.
    fn dispatch(&mut self) {
        while self.engine.in_flight() < self.engine.capacity() {
            let Some(mut pending) = self.waiting.pop_front() else {
                break;
            };
            let token = self.next_token;
            self.next_token += 1;
            pending.started = Instant::now();

            let request = TransferRequest {
                token,
                info: pending.target.info.clone(),
                directory: pending.directory.clone(),
                url: pending.url.clone(),
            };

            match self.engine.add(request) {
                Ok(()) => {
                    self.in_flight.insert(token, pending);
                }
                Err(e) => {
                    log::warn!("Failed to start listing of {}: {}", pending.url, e);
                    self.ready.push(ListingCompletion::failed(
                        pending.request_id,
                        pending.directory,
                        e.to_string(),
                    ));
                }
            }
        }
    }

    /// Advance all transfers and return the requests that finished.
    pub fn step(&mut self) -> Vec<ListingCompletion> {
        let now = Instant::now();

        // Retries whose backoff elapsed
        while self
            .retry_queue
            .front()
            .is_some_and(|(due, _)| *due <= now)
        {
            if let Some((_, pending)) = self.retry_queue.pop_front() {
                self.waiting.push_back(pending);
            }
        }

        for done in self.engine.perform() {
            self.finish(done);
        }
        self.dispatch();

        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, p)| p.started.elapsed() > self.config.request_timeout)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(pending) = self.in_flight.remove(&token) {
                self.timed_out += 1;
                let err = TransportError::Timeout(format!(
                    "no response for {} after {:?}",
                    pending.url, self.config.request_timeout
                ));
                self.fail_or_retry(pending, err);
            }
        }

        std::mem::take(&mut self.ready)
    }

    fn finish(&mut self, done: TransferDone) {
        // Results for requests that already timed out are dropped
        let Some(pending) = self.in_flight.remove(&done.token) else {
            log::trace!("Ignoring late result for transfer {}", done.token);
            return;
        };

        match done.result {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let lines: Vec<String> = text
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                log::trace!("Listed {} ({} lines)", pending.url, lines.len());
                self.ready.push(ListingCompletion {
                    request_id: pending.request_id,
                    directory: pending.directory,
                    lines,
                    success: true,
                    error: None,
                });
            }
            Err(e) => self.fail_or_retry(pending, e),
        }
    }

    fn fail_or_retry(&mut self, mut pending: PendingRequest, err: TransportError) {
        if self.config.auto_reconnect
            && err.is_retryable()
            && pending.attempts < self.config.retry_budget
        {
            let delay = self.config.backoff(pending.attempts);
            pending.attempts += 1;
            self.retried += 1;
            log::debug!(
                "Retrying {} in {:?} (attempt {}/{}): {}",
                pending.url,
                delay,
                pending.attempts,
                self.config.retry_budget,
                err
            );
            let due = Instant::now() + delay;
            // Keep the queue ordered by due time
            let index = self
                .retry_queue
                .iter()
                .position(|(d, _)| *d > due)
                .unwrap_or(self.retry_queue.len());
            self.retry_queue.insert(index, (due, pending));
        } else {
            log::debug!("Listing of {} failed: {}", pending.url, err);
            self.ready.push(ListingCompletion::failed(
                pending.request_id,
                pending.directory,
                err.to_string(),
            ));
        }
    }

    /// Requests registered but not yet returned by `step`.
    #[must_use]
    pub fn active_requests(&self) -> usize {
        self.waiting.len() + self.in_flight.len() + self.retry_queue.len() + self.ready.len()
    }

    /// Ids of the requests currently held by the engine.
    #[must_use]
    pub fn dispatched_request_ids(&self) -> HashSet<u64> {
        self.in_flight.values().map(|p| p.request_id).collect()
    }

    /// Abort every outstanding request without reporting them.
    pub fn cancel_all(&mut self) {
        let aborted = self.active_requests();
        self.engine.cancel_all();
        self.waiting.clear();
        self.in_flight.clear();
        self.retry_queue.clear();
        self.ready.clear();
        if aborted > 0 {
            log::debug!("Aborted {} outstanding listing requests", aborted);
        }
    }

    /// Requests that hit the per-request deadline.
    #[must_use]
    pub fn timed_out_count(&self) -> u64 {
        self.timed_out
    }

    /// Retries scheduled so far.
    #[must_use]
    pub fn retried_count(&self) -> u64 {
        self.retried
    }

    /// Step on the configured tick until nothing is outstanding or `limit`
    /// elapses, collecting every completion.
    pub fn run_until_idle(&mut self, limit: Duration) -> Vec<ListingCompletion> {
        let deadline = Instant::now() + limit;
        let mut completions = Vec::new();
        loop {
            completions.extend(self.step());
            if self.active_requests() == 0 || Instant::now() >= deadline {
                break;
            }
            thread::sleep(self.config.tick);
        }
        completions
    }
}
