//! Duplicate grouping.
//!
//! # Overview
//!
//! Grouping happens twice in a scan:
//!
//! 1. **By size**: files with different sizes cannot be duplicates, so only
//!    sizes shared by two or more files become hashing candidates.
//! 2. **By hash**: candidates are grouped by `(size, hash)`; every group with
//!    two or more members is a [`DuplicateGroup`].
//!
//! Which member of a group is the one to keep is not decided here beyond
//! what the configured [`KeepPolicy`] says. The default policy picks none.
//!
//! # Example
//!
//! ```
//! use netdupe::duplicates::group_by_size;
//! use netdupe::scanner::Location;
//! use std::collections::HashMap;
//!
//! let mut sizes = HashMap::new();
//! sizes.insert(Location::local("/a"), 100);
//! sizes.insert(Location::local("/b"), 100);
//! sizes.insert(Location::local("/c"), 50);
//!
//! let (buckets, stats) = group_by_size(&sizes, 0);
//! assert_eq!(buckets.len(), 1);
//! assert_eq!(stats.candidates, 2);
//! assert_eq!(stats.eliminated_unique, 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

use crate::scanner::{hash_to_hex, FullHash, Location};

/// Files sharing one exact size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeBucket {
    /// Size in bytes shared by every member
    pub size: u64,
    /// Files with this size, sorted
    pub members: Vec<Location>,
}

impl SizeBucket {
    /// Number of files in this bucket.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if this bucket is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Statistics from size filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SizeFilterStats {
    /// Files considered
    pub total_files: usize,
    /// Files sharing their size with at least one other file
    pub candidates: usize,
    /// Files dropped because no other file has their size
    pub eliminated_unique: usize,
    /// Empty files (never candidates, they all hash the same)
    pub empty_files: usize,
    /// Files below the minimum size
    pub below_min_size: usize,
    /// Size buckets with two or more members
    pub buckets: usize,
}

impl SizeFilterStats {
    /// Percentage of files eliminated by size filtering.
    #[must_use]
    pub fn elimination_rate(&self) -> f64 {
        if self.total_files == 0 {
            0.0
        } else {
            ((self.total_files - self.candidates) as f64 / self.total_files as f64) * 100.0
        }
    }
}

/// Group files by size, keeping only sizes shared by two or more files.
///
/// Empty files and files smaller than `min_size` are never candidates.
/// Buckets are returned largest size first.
#[must_use]
pub fn group_by_size(
    sizes: &HashMap<Location, u64>,
    min_size: u64,
) -> (Vec<SizeBucket>, SizeFilterStats) {
    let mut stats = SizeFilterStats {
        total_files: sizes.len(),
        ..SizeFilterStats::default()
    };
    let mut by_size: HashMap<u64, Vec<Location>> = HashMap::new();

    for (location, &size) in sizes {
        if size == 0 {
            stats.empty_files += 1;
            continue;
        }
        if size < min_size {
            stats.below_min_size += 1;
            continue;
        }
        by_size.entry(size).or_default().push(location.clone());
    }

    if stats.empty_files > 0 {
        log::debug!("Skipped {} empty file(s)", stats.empty_files);
    }

    let mut buckets: Vec<SizeBucket> = by_size
        .into_iter()
        .filter_map(|(size, mut members)| {
            if members.len() < 2 {
                stats.eliminated_unique += members.len();
                return None;
            }
            members.sort();
            stats.candidates += members.len();
            Some(SizeBucket { size, members })
        })
        .collect();
    buckets.sort_by(|a, b| b.size.cmp(&a.size));
    stats.buckets = buckets.len();

    log::info!(
        "Size filter: {} files → {} candidates ({:.1}% eliminated)",
        stats.total_files,
        stats.candidates,
        stats.elimination_rate()
    );

    (buckets, stats)
}

/// Content digest shared by the members of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashValue {
    /// Head + tail + size quick hash
    Quick(u64),
    /// BLAKE3 digest of the whole content
    Full(FullHash),
}

impl HashValue {
    /// Whether the group was confirmed by a full content hash.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quick(hash) => write!(f, "quick:{hash:016x}"),
            Self::Full(hash) => write!(f, "{}", hash_to_hex(hash)),
        }
    }
}

impl Serialize for HashValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Two or more files considered identical under the active mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    /// Digest shared by every member
    pub hash: HashValue,
    /// Size in bytes shared by every member
    pub size: u64,
    /// Member files, sorted
    pub members: Vec<Location>,
    /// Index into `members` of the file to keep, if a keep policy chose one
    pub canonical: Option<usize>,
}

impl DuplicateGroup {
    /// Create a group; members are sorted.
    #[must_use]
    pub fn new(hash: HashValue, size: u64, mut members: Vec<Location>) -> Self {
        members.sort();
        Self {
            hash,
            size,
            members,
            canonical: None,
        }
    }

    /// Number of files in this group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if this group is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Space taken by all copies but one.
    #[must_use]
    pub fn wasted_space(&self) -> u64 {
        self.size * (self.members.len().saturating_sub(1) as u64)
    }

    /// The file chosen to keep, if any.
    #[must_use]
    pub fn canonical(&self) -> Option<&Location> {
        self.canonical.and_then(|i| self.members.get(i))
    }
}

/// Group hashed files by `(size, hash)`.
///
/// Files present in `records` but missing from `sizes` are ignored. Groups are
/// returned most wasted space first.
pub fn group_by_hash<H, F>(
    records: &HashMap<Location, H>,
    sizes: &HashMap<Location, u64>,
    to_value: F,
) -> Vec<DuplicateGroup>
where
    H: Copy + Eq + Hash,
    F: Fn(H) -> HashValue,
{
    let mut by_key: HashMap<(u64, H), Vec<Location>> = HashMap::new();
    for (location, &hash) in records {
        if let Some(&size) = sizes.get(location) {
            by_key.entry((size, hash)).or_default().push(location.clone());
        }
    }

    let mut groups: Vec<DuplicateGroup> = by_key
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|((size, hash), members)| DuplicateGroup::new(to_value(hash), size, members))
        .collect();

    groups.sort_by(|a, b| {
        b.wasted_space()
            .cmp(&a.wasted_space())
            .then_with(|| a.members.cmp(&b.members))
    });
    groups
}

/// Rule choosing which member of a group to keep.
pub type KeepRule = Arc<dyn Fn(&[Location]) -> Option<usize> + Send + Sync>;

/// Policy for marking one member of each group as the file to keep.
#[derive(Clone, Default)]
pub enum KeepPolicy {
    /// Mark nothing; the caller decides
    #[default]
    Unspecified,
    /// Keep the member with the shortest location
    ShortestPath,
    /// Keep the lexicographically first member
    FirstLexicographic,
    /// Keep whatever the rule returns
    Custom(KeepRule),
}

impl fmt::Debug for KeepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "Unspecified"),
            Self::ShortestPath => write!(f, "ShortestPath"),
            Self::FirstLexicographic => write!(f, "FirstLexicographic"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl KeepPolicy {
    /// Index of the member to keep.
    #[must_use]
    pub fn select(&self, members: &[Location]) -> Option<usize> {
        match self {
            Self::Unspecified => None,
            Self::ShortestPath => members
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.display_len().cmp(&b.display_len()).then_with(|| a.cmp(b)))
                .map(|(i, _)| i),
            Self::FirstLexicographic => members
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.cmp(b))
                .map(|(i, _)| i),
            Self::Custom(rule) => rule(members).filter(|&i| i < members.len()),
        }
    }

    /// Set `canonical` on every group.
    pub fn apply(&self, groups: &mut [DuplicateGroup]) {
        for group in groups {
            group.canonical = self.select(&group.members);
        }
    }
}

/// Serializable name of a built-in [`KeepPolicy`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum KeepPolicyKind {
    /// See [`KeepPolicy::Unspecified`]
    #[default]
    Unspecified,
    /// See [`KeepPolicy::ShortestPath`]
    ShortestPath,
    /// See [`KeepPolicy::FirstLexicographic`]
    #[serde(alias = "first_lexicographic")]
    Lexicographic,
}

impl From<KeepPolicyKind> for KeepPolicy {
    fn from(kind: KeepPolicyKind) -> Self {
        match kind {
            KeepPolicyKind::Unspecified => Self::Unspecified,
            KeepPolicyKind::ShortestPath => Self::ShortestPath,
            KeepPolicyKind::Lexicographic => Self::FirstLexicographic,
        }
    }
}
