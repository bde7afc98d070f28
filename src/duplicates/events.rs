//! Scan event delivery.
//!
//! The orchestrator reports everything through a [`ScanListener`]. Every
//! method has an empty default so listeners implement only what they need.
//! [`ChannelListener`] forwards events as [`ScanEvent`] values into a
//! crossbeam channel for consumers that prefer to poll.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::orchestrator::ScanResult;
use super::ScanPhase;
use crate::scanner::ScanError;

/// Receiver of scan events.
///
/// Methods are called from the orchestrator's driver thread and must not
/// block for long.
pub trait ScanListener: Send + Sync {
    /// A scan started.
    fn on_scan_started(&self) {}

    /// The pipeline entered `phase`.
    fn on_phase_changed(&self, _phase: ScanPhase) {}

    /// Periodic progress of the current phase.
    ///
    /// During collection the total is not known yet and is reported as 0.
    fn on_progress(&self, _processed: usize, _total: usize, _percent: f64) {}

    /// Throughput sample of the current phase.
    fn on_speed(&self, _files_per_second: f64, _active_workers: usize) {}

    /// The scan completed. Not called for cancelled or failed scans.
    fn on_completed(&self, _result: &ScanResult) {}

    /// One root could not be scanned; the others continue.
    fn on_error(&self, _error: &ScanError) {}

    /// The scan stopped on a fatal error.
    fn on_failed(&self, _reason: &str) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl ScanListener for NullListener {}

/// Listener forwarding every event to several listeners in order.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn ScanListener>>,
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ListenerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener.
    #[must_use]
    pub fn with(mut self, listener: Arc<dyn ScanListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl ScanListener for ListenerSet {
    fn on_scan_started(&self) {
        self.listeners.iter().for_each(|l| l.on_scan_started());
    }

    fn on_phase_changed(&self, phase: ScanPhase) {
        self.listeners.iter().for_each(|l| l.on_phase_changed(phase));
    }

    fn on_progress(&self, processed: usize, total: usize, percent: f64) {
        for listener in &self.listeners {
            listener.on_progress(processed, total, percent);
        }
    }

    fn on_speed(&self, files_per_second: f64, active_workers: usize) {
        for listener in &self.listeners {
            listener.on_speed(files_per_second, active_workers);
        }
    }

    fn on_completed(&self, result: &ScanResult) {
        self.listeners.iter().for_each(|l| l.on_completed(result));
    }

    fn on_error(&self, error: &ScanError) {
        self.listeners.iter().for_each(|l| l.on_error(error));
    }

    fn on_failed(&self, reason: &str) {
        self.listeners.iter().for_each(|l| l.on_failed(reason));
    }
}

/// A scan event as a value.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// See [`ScanListener::on_scan_started`]
    Started,
    /// See [`ScanListener::on_phase_changed`]
    PhaseChanged(ScanPhase),
    /// See [`ScanListener::on_progress`]
    Progress {
        /// Items done in the current phase
        processed: usize,
        /// Items in the current phase (0 while unknown)
        total: usize,
        /// Completion percentage
        percent: f64,
    },
    /// See [`ScanListener::on_speed`]
    Speed {
        /// Items per second since the phase started
        files_per_second: f64,
        /// Worker tasks currently running
        active_workers: usize,
    },
    /// See [`ScanListener::on_completed`]
    Completed(Box<ScanResult>),
    /// See [`ScanListener::on_error`]
    Error(ScanError),
    /// See [`ScanListener::on_failed`]
    Failed(String),
}

/// Listener forwarding every event into a channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: Sender<ScanEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel.
    #[must_use]
    pub fn channel() -> (Self, Receiver<ScanEvent>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }

    fn send(&self, event: ScanEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.sender.send(event);
    }
}

impl ScanListener for ChannelListener {
    fn on_scan_started(&self) {
        self.send(ScanEvent::Started);
    }

    fn on_phase_changed(&self, phase: ScanPhase) {
        self.send(ScanEvent::PhaseChanged(phase));
    }

    fn on_progress(&self, processed: usize, total: usize, percent: f64) {
        self.send(ScanEvent::Progress {
            processed,
            total,
            percent,
        });
    }

    fn on_speed(&self, files_per_second: f64, active_workers: usize) {
        self.send(ScanEvent::Speed {
            files_per_second,
            active_workers,
        });
    }

    fn on_completed(&self, result: &ScanResult) {
        self.send(ScanEvent::Completed(Box::new(result.clone())));
    }

    fn on_error(&self, error: &ScanError) {
        self.send(ScanEvent::Error(error.clone()));
    }

    fn on_failed(&self, reason: &str) {
        self.send(ScanEvent::Failed(reason.to_string()));
    }
}
