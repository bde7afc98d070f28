//! Duplicate detection module.
//!
//! This module provides functionality for:
//! - Size-based file grouping (the first candidate filter)
//! - Quick-hash and full-hash grouping
//! - The phased [`ScanOrchestrator`] that drives collection and hashing
//! - Scan events delivered through [`ScanListener`]

pub mod events;
pub mod groups;
pub mod orchestrator;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

pub use events::{ChannelListener, ListenerSet, NullListener, ScanEvent, ScanListener};
pub use groups::{
    group_by_hash, group_by_size, DuplicateGroup, HashValue, KeepPolicy, KeepPolicyKind,
    KeepRule, SizeBucket, SizeFilterStats,
};
pub use orchestrator::{
    OrchestratorError, ScanConfig, ScanOrchestrator, ScanResult, ScanStats, StartStatus,
};

/// Cost/accuracy profile of a scan.
///
/// | mode | quick-hash chunk | threads |
/// |---|---|---|
/// | Turbo | 4096 bytes | `max(10, 3 × cores)` |
/// | Balanced | 8192 bytes | `max(5, cores)` |
/// | Accurate | none, full hash only | `max(3, cores / 2)` |
///
/// In Turbo and Balanced mode, files sharing size and quick hash are reported
/// as duplicates without reading the rest of their content. This is an
/// approximation; enable collision confirmation to full-hash them first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SpeedMode {
    /// Smallest quick-hash chunk, most threads
    Turbo,
    /// Default trade-off
    #[default]
    Balanced,
    /// Full content hash for every candidate
    Accurate,
}

impl SpeedMode {
    /// Bytes read from each end of a file for the quick hash; 0 skips it.
    #[must_use]
    pub fn quick_chunk_size(self) -> usize {
        match self {
            Self::Turbo => 4096,
            Self::Balanced => 8192,
            Self::Accurate => 0,
        }
    }

    /// Whether this mode runs the quick-hash phase.
    #[must_use]
    pub fn uses_quick_hash(self) -> bool {
        self.quick_chunk_size() > 0
    }

    /// Worker threads recommended for `cores` hardware threads.
    #[must_use]
    pub fn recommended_threads(self, cores: usize) -> usize {
        let cores = cores.max(1);
        match self {
            Self::Turbo => (cores * 3).max(10),
            Self::Balanced => cores.max(5),
            Self::Accurate => (cores / 2).max(3),
        }
    }
}

impl fmt::Display for SpeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Turbo => write!(f, "turbo"),
            Self::Balanced => write!(f, "balanced"),
            Self::Accurate => write!(f, "accurate"),
        }
    }
}

/// Pipeline state.
///
/// `Idle → Collecting → SizeFiltering → QuickHashing → [FullHashing] →
/// Comparing → Completed`, with `Cancelled` reachable from any non-terminal
/// state and `Failed` on process-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ScanPhase {
    /// No scan has run yet
    Idle = 0,
    /// Enumerating roots
    Collecting = 1,
    /// Grouping collected files by size
    SizeFiltering = 2,
    /// Hashing head and tail of candidates
    QuickHashing = 3,
    /// Hashing whole candidate files
    FullHashing = 4,
    /// Building duplicate groups
    Comparing = 5,
    /// Finished with results
    Completed = 6,
    /// Stopped on request
    Cancelled = 7,
    /// Stopped by a fatal error
    Failed = 8,
}

impl ScanPhase {
    /// Whether the scan has finished in this phase.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Human-readable phase name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::SizeFiltering => "size filtering",
            Self::QuickHashing => "quick hashing",
            Self::FullHashing => "full hashing",
            Self::Comparing => "comparing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Collecting,
            2 => Self::SizeFiltering,
            3 => Self::QuickHashing,
            4 => Self::FullHashing,
            5 => Self::Comparing,
            6 => Self::Completed,
            7 => Self::Cancelled,
            8 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lock-free cell holding the current [`ScanPhase`].
#[derive(Debug)]
pub(crate) struct AtomicPhase(AtomicU8);

impl AtomicPhase {
    pub(crate) fn new(phase: ScanPhase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    pub(crate) fn load(&self) -> ScanPhase {
        ScanPhase::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, phase: ScanPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }
}
