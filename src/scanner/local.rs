//! Local directory collection.
//!
//! One call walks one root with `walkdir`, never following symbolic links,
//! and flushes `(path, size)` batches into the shared [`CollectionTable`].
//! The orchestrator runs each root as its own task-pool job.
//!
//! System-style locations are always skipped: pseudo filesystems such as
//! `/proc` and `/sys`, and Windows housekeeping folders like
//! `System Volume Information` and `$RECYCLE.BIN`. User patterns are added
//! on top with gitignore syntax.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use walkdir::{DirEntry, WalkDir};

use super::{CollectionTable, FileEntry, Location, ScanError};
use crate::tasks::CancelToken;

/// Absolute directories that are never descended into.
const SYSTEM_PATHS: &[&str] = &["/proc", "/sys", "/dev", "/run"];

/// Directory names excluded wherever they appear.
const DEFAULT_EXCLUDES: &[&str] = &["System Volume Information/", "$RECYCLE.BIN/", "lost+found/"];

/// Options for a local walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCollectorConfig {
    /// Extra gitignore-style patterns to skip
    pub exclude_patterns: Vec<String>,
    /// Entries buffered before each table insert
    pub batch_size: usize,
}

impl Default for LocalCollectorConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            batch_size: 512,
        }
    }
}

impl LocalCollectorConfig {
    /// Set extra exclude patterns.
    #[must_use]
    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }
}

/// Result of one local walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalSummary {
    /// Files added to the table
    pub files: usize,
    /// Entries that could not be read
    pub skipped: usize,
    /// Whether the walk stopped early on cancellation
    pub cancelled: bool,
}

/// Walk `root` and record every regular file in `table`.
///
/// Unreadable entries are logged and counted, not fatal.
///
/// # Errors
///
/// Returns [`ScanError::RootNotFound`] if `root` is not a readable directory.
///
/// # Example
///
/// ```
/// use netdupe::scanner::{collect_local, CollectionTable, LocalCollectorConfig};
/// use netdupe::tasks::CancelToken;
///
/// let dir = tempfile::tempdir().unwrap();
/// std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
///
/// let table = CollectionTable::new();
/// let summary = collect_local(
///     dir.path(),
///     &LocalCollectorConfig::default(),
///     &table,
///     &CancelToken::new(),
/// )
/// .unwrap();
/// assert_eq!(summary.files, 1);
/// ```
pub fn collect_local(
    root: &Path,
    config: &LocalCollectorConfig,
    table: &CollectionTable,
    cancel: &CancelToken,
) -> Result<LocalSummary, ScanError> {
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(ScanError::RootNotFound(root.to_path_buf())),
    }

    let excludes = build_excludes(root, &config.exclude_patterns);
    let batch_size = config.batch_size.max(1);
    let mut summary = LocalSummary::default();
    let mut batch = Vec::with_capacity(batch_size);

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_excluded(root, entry, &excludes));

    for result in walker {
        if cancel.is_cancelled() {
            log::debug!("Local walk of {} cancelled", root.display());
            summary.cancelled = true;
            break;
        }

        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                log::warn!("Cannot read {}: {}", path.display(), e);
                summary.skipped += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        match entry.metadata() {
            Ok(meta) => batch.push(FileEntry::new(
                Location::Local(entry.into_path()),
                meta.len(),
            )),
            Err(e) => {
                log::debug!("Cannot stat {}: {}", entry.path().display(), e);
                summary.skipped += 1;
            }
        }

        if batch.len() >= batch_size {
            summary.files += table.insert_batch(std::mem::take(&mut batch));
        }
    }

    summary.files += table.insert_batch(batch);
    log::debug!(
        "Collected {} files under {} ({} skipped)",
        summary.files,
        root.display(),
        summary.skipped
    );
    Ok(summary)
}

fn build_excludes(root: &Path, patterns: &[String]) -> Option<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in DEFAULT_EXCLUDES
        .iter()
        .copied()
        .chain(patterns.iter().map(String::as_str))
    {
        if let Err(e) = builder.add_line(None, pattern) {
            log::warn!("Invalid exclude pattern '{}': {}", pattern, e);
        }
    }

    match builder.build() {
        Ok(gitignore) if !gitignore.is_empty() => Some(gitignore),
        Ok(_) => None,
        Err(e) => {
            log::warn!("Failed to build exclude patterns: {}", e);
            None
        }
    }
}

fn is_excluded(root: &Path, entry: &DirEntry, excludes: &Option<Gitignore>) -> bool {
    let path = entry.path();
    if entry.depth() == 0 {
        return false;
    }

    let is_dir = entry.file_type().is_dir();
    if is_dir && SYSTEM_PATHS.iter().any(|p| path == Path::new(p)) {
        log::trace!("Skipping system directory: {}", path.display());
        return true;
    }

    let Some(gitignore) = excludes else {
        return false;
    };
    let relative: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    let ignored = gitignore.matched(&relative, is_dir).is_ignore();
    if ignored {
        log::trace!("Excluded: {}", path.display());
    }
    ignored
}
