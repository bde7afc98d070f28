//! Plain-text report.

use std::io::{self, Write};

use bytesize::ByteSize;

use crate::duplicates::ScanResult;

/// Human-readable report of a [`ScanResult`].
#[derive(Debug)]
pub struct TextOutput<'a> {
    result: &'a ScanResult,
}

impl<'a> TextOutput<'a> {
    /// Wrap a result for printing.
    #[must_use]
    pub fn new(result: &'a ScanResult) -> Self {
        Self { result }
    }

    /// Write the report.
    ///
    /// Each group lists its members one per line; the member chosen by the
    /// keep policy is marked with `*`.
    ///
    /// # Errors
    ///
    /// Returns any error from the writer.
    pub fn write_to<W: Write>(&self, mut out: W) -> io::Result<()> {
        let result = self.result;
        for (idx, group) in result.groups.iter().enumerate() {
            writeln!(
                out,
                "Group {} ({} files, {} each, hash {})",
                idx + 1,
                group.len(),
                ByteSize(group.size),
                group.hash
            )?;
            for (member_idx, member) in group.members.iter().enumerate() {
                let marker = if group.canonical == Some(member_idx) { '*' } else { ' ' };
                writeln!(out, "  {marker} {member}")?;
            }
            writeln!(out)?;
        }

        for error in &result.root_errors {
            writeln!(out, "warning: {error}")?;
        }

        let stats = &result.stats;
        writeln!(
            out,
            "Scanned {} files ({} candidates) in {:.2}s [{} mode]",
            stats.files_collected,
            stats.candidates,
            stats.elapsed_ms as f64 / 1000.0,
            result.mode
        )?;
        if stats.hash_failures > 0 {
            writeln!(out, "{} files could not be hashed", stats.hash_failures)?;
        }
        if result.groups.is_empty() {
            writeln!(out, "No duplicates found")?;
        } else {
            writeln!(
                out,
                "{} duplicate groups, {} duplicate files, {} reclaimable",
                result.groups.len(),
                result.duplicate_files(),
                ByteSize(result.wasted_space())
            )?;
        }
        Ok(())
    }
}
