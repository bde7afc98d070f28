//! Report formatters for scan results.
//!
//! - [`TextOutput`]: human-readable summary for the terminal
//! - [`JsonOutput`]: machine-readable document for scripting
//! - [`CsvOutput`]: one row per duplicate file for spreadsheets

pub mod csv;
pub mod json;
pub mod text;

pub use csv::{CsvOutput, CsvOutputError};
pub use json::{JsonDuplicateGroup, JsonOutput, JsonSummary};
pub use text::TextOutput;
