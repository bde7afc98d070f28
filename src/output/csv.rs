//! CSV report, one row per duplicate file.
//!
//! # Columns
//!
//! - `group_id`: 1-based group number
//! - `hash`: group digest
//! - `location`: local path or remote URL
//! - `size`: file size in bytes
//! - `keep`: whether the keep policy chose this file

use std::io;

use serde::Serialize;
use thiserror::Error;

use crate::duplicates::DuplicateGroup;

/// CSV generation errors.
#[derive(Debug, Error)]
pub enum CsvOutputError {
    /// Writing failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    group_id: usize,
    hash: &'a str,
    location: String,
    size: u64,
    keep: bool,
}

/// CSV formatter over duplicate groups.
#[derive(Debug)]
pub struct CsvOutput<'a> {
    groups: &'a [DuplicateGroup],
}

impl<'a> CsvOutput<'a> {
    /// Wrap groups for output.
    #[must_use]
    pub fn new(groups: &'a [DuplicateGroup]) -> Self {
        Self { groups }
    }

    /// Write the rows with a header line.
    ///
    /// # Errors
    ///
    /// Returns `CsvOutputError` if writing or serialization fails.
    pub fn write_to<W: io::Write>(&self, writer: W) -> Result<(), CsvOutputError> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        for (idx, group) in self.groups.iter().enumerate() {
            let hash = group.hash.to_string();
            for (member_idx, member) in group.members.iter().enumerate() {
                csv_writer.serialize(CsvRow {
                    group_id: idx + 1,
                    hash: &hash,
                    location: member.to_string(),
                    size: group.size,
                    keep: group.canonical == Some(member_idx),
                })?;
            }
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Render to a string.
    ///
    /// # Errors
    ///
    /// Returns `CsvOutputError` if serialization fails.
    pub fn to_string(&self) -> Result<String, CsvOutputError> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
