//! JSON report.
//!
//! # Output Schema
//!
//! ```json
//! {
//!   "duplicates": [
//!     {
//!       "hash": "9f86d0...",
//!       "size": 1024,
//!       "files": ["/data/a.bin", "ftp://nas:21/backup/a.bin"],
//!       "keep": "/data/a.bin"
//!     }
//!   ],
//!   "summary": {
//!     "mode": "balanced",
//!     "files_collected": 100,
//!     "duplicate_groups": 1,
//!     "reclaimable_space": 1024,
//!     "exit_code": 0,
//!     ...
//!   },
//!   "errors": []
//! }
//! ```

use std::io::Write;

use serde::Serialize;

use crate::duplicates::{DuplicateGroup, ScanResult, SpeedMode};
use crate::error::ExitCode;

/// One duplicate group.
#[derive(Debug, Clone, Serialize)]
pub struct JsonDuplicateGroup {
    /// Full digest in hex, or `quick:<hex>` for quick-hash groups
    pub hash: String,
    /// File size in bytes
    pub size: u64,
    /// Member locations, sorted
    pub files: Vec<String>,
    /// Member chosen by the keep policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep: Option<String>,
}

impl From<&DuplicateGroup> for JsonDuplicateGroup {
    fn from(group: &DuplicateGroup) -> Self {
        Self {
            hash: group.hash.to_string(),
            size: group.size,
            files: group.members.iter().map(ToString::to_string).collect(),
            keep: group.canonical().map(ToString::to_string),
        }
    }
}

/// Scan summary.
#[derive(Debug, Clone, Serialize)]
pub struct JsonSummary {
    /// Speed mode
    pub mode: SpeedMode,
    /// Files collected across all roots
    pub files_collected: usize,
    /// Files sharing their size with another file
    pub candidates: usize,
    /// Files quick-hashed
    pub quick_hashed: usize,
    /// Files full-hashed
    pub full_hashed: usize,
    /// Files that could not be hashed
    pub hash_failures: usize,
    /// Roots that could not be scanned
    pub roots_failed: usize,
    /// Remote subdirectories that could not be listed
    pub directories_failed: usize,
    /// Number of duplicate groups
    pub duplicate_groups: usize,
    /// Files duplicating another file
    pub duplicate_files: usize,
    /// Bytes reclaimable by keeping one file per group
    pub reclaimable_space: u64,
    /// Scan duration in milliseconds
    pub scan_duration_ms: u64,
    /// Process exit code
    pub exit_code: i32,
    /// Exit code name (e.g. "ND000")
    pub exit_code_name: String,
}

impl JsonSummary {
    /// Summarize a result.
    #[must_use]
    pub fn new(result: &ScanResult, exit_code: ExitCode) -> Self {
        let stats = &result.stats;
        Self {
            mode: result.mode,
            files_collected: stats.files_collected,
            candidates: stats.candidates,
            quick_hashed: stats.quick_hashed,
            full_hashed: stats.full_hashed,
            hash_failures: stats.hash_failures,
            roots_failed: stats.roots_failed,
            directories_failed: stats.directories_failed,
            duplicate_groups: result.groups.len(),
            duplicate_files: result.duplicate_files(),
            reclaimable_space: result.wasted_space(),
            scan_duration_ms: stats.elapsed_ms,
            exit_code: exit_code.as_i32(),
            exit_code_name: exit_code.code_prefix().to_string(),
        }
    }
}

/// JSON report of a [`ScanResult`].
#[derive(Debug, Clone, Serialize)]
pub struct JsonOutput {
    /// Duplicate groups
    pub duplicates: Vec<JsonDuplicateGroup>,
    /// Summary counters
    pub summary: JsonSummary,
    /// Per-root errors
    pub errors: Vec<String>,
}

impl JsonOutput {
    /// Build the report.
    #[must_use]
    pub fn new(result: &ScanResult, exit_code: ExitCode) -> Self {
        Self {
            duplicates: result.groups.iter().map(JsonDuplicateGroup::from).collect(),
            summary: JsonSummary::new(result, exit_code),
            errors: result.root_errors.clone(),
        }
    }

    /// Compact JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write pretty JSON followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write_to<W: Write>(&self, mut writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(&mut writer, self)?;
        writeln!(writer).map_err(serde_json::Error::io)
    }
}
