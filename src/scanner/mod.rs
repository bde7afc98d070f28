//! Scanner module for file collection and content hashing.
//!
//! This module provides functionality for:
//! - Local collection (one walk per root, run on the task pool)
//! - Remote collection (breadth-first listing through the multiplexer)
//! - Quick (head + tail + size) and full (BLAKE3) content hashing
//!
//! # Architecture
//!
//! The scanner is divided into submodules:
//! - [`local`]: Local directory traversal
//! - [`remote`]: Remote directory traversal driven by listing completions
//! - [`hasher`]: Quick and full file hashing
//!
//! Both collectors write into a shared [`CollectionTable`].
//!
//! # Example
//!
//! ```
//! use netdupe::scanner::{CollectionTable, FileEntry, Location};
//!
//! let table = CollectionTable::new();
//! table.insert_batch(vec![
//!     FileEntry::new(Location::local("/data/a.bin"), 100),
//!     FileEntry::new(Location::local("/data/b.bin"), 100),
//! ]);
//! assert_eq!(table.len(), 2);
//! ```

pub mod hasher;
pub mod local;
pub mod remote;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::remote::LocatorError;
use crate::tasks::lock_unpoisoned;

// Re-export main types
pub use hasher::{hash_to_hex, FullHash, Hasher, FULL_HASH_CHUNK};
pub use local::{collect_local, LocalCollectorConfig, LocalSummary};
pub use remote::{RemoteCollector, RemoteCollectorConfig, RemoteSummary};

/// Where a collected file lives.
///
/// Local files keep their filesystem path; remote files are identified by
/// their full `scheme://host:port/path` location string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    /// File on a local filesystem
    Local(PathBuf),
    /// File on a remote server
    Remote(String),
}

impl Location {
    /// Location of a local file.
    #[must_use]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local(path.into())
    }

    /// Location of a remote file.
    #[must_use]
    pub fn remote(url: impl Into<String>) -> Self {
        Self::Remote(url.into())
    }

    /// Local path, if this is a local file.
    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path),
            Self::Remote(_) => None,
        }
    }

    /// Whether this file is on a remote server.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Length of the displayed location, used by path-based keep policies.
    #[must_use]
    pub fn display_len(&self) -> usize {
        match self {
            Self::Local(path) => path.as_os_str().len(),
            Self::Remote(url) => url.len(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => f.write_str(url),
        }
    }
}

impl Serialize for Location {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A collected file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Where the file lives
    pub location: Location,
    /// File size in bytes
    pub size: u64,
}

impl FileEntry {
    /// Create a new FileEntry.
    #[must_use]
    pub fn new(location: Location, size: u64) -> Self {
        Self { location, size }
    }
}

/// Shared table of every file collected during a scan.
///
/// Writers insert in batches under one mutex; the collected count is kept
/// in an atomic so progress can be read without touching the lock.
/// A location is recorded once; later inserts of the same location are
/// ignored.
#[derive(Debug, Default)]
pub struct CollectionTable {
    entries: Mutex<HashMap<Location, u64>>,
    count: AtomicUsize,
}

impl CollectionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a batch of entries, returning how many were new.
    pub fn insert_batch(&self, batch: Vec<FileEntry>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let mut entries = lock_unpoisoned(&self.entries);
        let mut added = 0;
        for entry in batch {
            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(entry.location)
            {
                slot.insert(entry.size);
                added += 1;
            }
        }
        drop(entries);
        self.count.fetch_add(added, Ordering::Relaxed);
        added
    }

    /// Number of collected files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Check if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the location → size table.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<Location, u64> {
        lock_unpoisoned(&self.entries).clone()
    }

    /// Take the table contents, leaving it empty.
    pub fn take(&self) -> HashMap<Location, u64> {
        let taken = std::mem::take(&mut *lock_unpoisoned(&self.entries));
        self.count.store(0, Ordering::Relaxed);
        taken
    }
}

/// Errors that abort the collection of one scan root.
///
/// Other roots are unaffected; the orchestrator reports these as scan
/// errors and keeps going.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The server of a remote root could not be reached or refused the login.
    #[error("Remote root {root} is unreachable: {reason}")]
    RootUnreachable {
        /// Root as given by the user
        root: String,
        /// Why the root listing failed
        reason: String,
    },

    /// A local root does not exist or is not a directory.
    #[error("Root not found or not a directory: {0}")]
    RootNotFound(PathBuf),

    /// No credentials are known and the protocol has no anonymous login.
    #[error("No credentials for remote root {0}")]
    MissingCredentials(String),

    /// The root uses a scheme no connector handles.
    #[error("Unsupported scheme '{scheme}' for root {root}")]
    UnsupportedRoot {
        /// Root as given by the user
        root: String,
        /// Scheme of the root
        scheme: String,
    },

    /// A remote root produced no listing completion within the watchdog period.
    #[error("Remote root {root} stalled: no listing completed within {after:?}")]
    WatchdogExpired {
        /// Root as given by the user
        root: String,
        /// Watchdog period
        after: Duration,
    },

    /// The root text could not be parsed.
    #[error(transparent)]
    Locator(#[from] LocatorError),
}

impl ScanError {
    /// Root the error refers to, when there is one.
    #[must_use]
    pub fn root(&self) -> Option<String> {
        match self {
            Self::RootUnreachable { root, .. }
            | Self::UnsupportedRoot { root, .. }
            | Self::WatchdogExpired { root, .. }
            | Self::MissingCredentials(root) => Some(root.clone()),
            Self::RootNotFound(path) => Some(path.display().to_string()),
            Self::Locator(_) => None,
        }
    }
}

/// Errors that can occur during file hashing.
///
/// Hash failures never abort a scan: the file is logged, counted and left
/// out of grouping.
#[derive(thiserror::Error, Debug)]
pub enum HashError {
    /// The file vanished before it could be read.
    #[error("File not found: {0}")]
    NotFound(Location),

    /// Permission was denied when reading the file.
    #[error("Permission denied: {0}")]
    PermissionDenied(Location),

    /// An I/O error occurred while reading the file.
    #[error("I/O error for {location}: {source}")]
    Io {
        /// File being read
        location: Location,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file's content cannot be read through this hasher.
    #[error("Content of {0} cannot be read for hashing")]
    Unsupported(Location),

    /// The hashing task was cancelled mid-file.
    #[error("Hashing cancelled")]
    Cancelled,
}

impl HashError {
    /// Classify an I/O error raised while reading `location`.
    #[must_use]
    pub fn from_io(location: &Location, error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::NotFound => Self::NotFound(location.clone()),
            ErrorKind::PermissionDenied => Self::PermissionDenied(location.clone()),
            _ => Self::Io {
                location: location.clone(),
                source: error,
            },
        }
    }
}
