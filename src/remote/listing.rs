//! Directory listing line parser.
//!
//! Servers answer `LIST` with free-form text. Two layouts cover nearly every
//! server seen in practice:
//!
//! - **Unix**: `drwxr-xr-x  2 owner group  4096 Jan 01 12:00 name`
//! - **DOS/IIS**: `01-15-24  03:45PM  <DIR>  name` or `01-15-24  03:45PM  1234  name`
//!
//! Lines matching neither fall back to a lenient split that takes the last
//! whitespace-delimited token as the name. Hidden entries (leading `.`),
//! including `.` and `..`, are dropped.

use std::sync::OnceLock;

use regex::Regex;

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory (traversed by the remote collector)
    Directory,
    /// Symbolic link (never followed)
    Symlink,
}

/// One parsed listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Entry name without any directory component
    pub name: String,
    /// Entry kind
    pub kind: EntryKind,
    /// Size in bytes, when the line carried one
    pub size: Option<u64>,
}

/// A listing line that matched no known layout.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unparseable listing line: {line}")]
pub struct ListingParseError {
    /// The offending line
    pub line: String,
}

fn unix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // type, 9 permission chars, optional ACL/xattr marker, link count,
        // owner, optional group, size, month, day, time-or-year, name
        Regex::new(
            r"^([dlbcps\-])[rwxsStTlL\-]{9}[.+@]?\s+\d+\s+\S+\s+(?:\S+\s+)?(\d+)\s+[A-Za-z]{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4})\s+(.+)$",
        )
        .expect("unix listing pattern is valid")
    })
}

fn dos_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^(\d{2}-\d{2}-(?:\d{2}|\d{4}))\s+(\d{1,2}:\d{2}\s*[AP]M)\s+(?:(<DIR>)|(\d+))\s+(.+)$",
        )
        .expect("dos listing pattern is valid")
    })
}

/// Parse one listing line.
///
/// Returns `Ok(None)` for lines that are valid but not reportable (hidden
/// entries, `.`/`..`, blank lines and `total N` headers).
///
/// # Errors
///
/// Returns [`ListingParseError`] when the line matches no known layout.
///
/// # Example
///
/// ```
/// use netdupe::remote::listing::{parse_line, EntryKind};
///
/// let entry = parse_line("-rw-r--r-- 1 ftp ftp 1024 Mar 03 2021 movie.mkv")
///     .unwrap()
///     .unwrap();
/// assert_eq!(entry.name, "movie.mkv");
/// assert_eq!(entry.kind, EntryKind::File);
/// assert_eq!(entry.size, Some(1024));
/// ```
pub fn parse_line(line: &str) -> Result<Option<ListingEntry>, ListingParseError> {
    let line = line.trim();
    if line.is_empty() || is_total_header(line) {
        return Ok(None);
    }

    let entry = parse_unix(line)
        .or_else(|| parse_dos(line))
        .or_else(|| parse_fallback(line))
        .ok_or_else(|| ListingParseError {
            line: line.to_string(),
        })?;

    if entry.name.is_empty() || entry.name.starts_with('.') {
        return Ok(None);
    }
    Ok(Some(entry))
}

/// Parse every line of a listing, logging and counting unparseable ones.
///
/// Returns the entries and the number of lines that could not be parsed.
pub fn parse_listing<'a, I>(lines: I) -> (Vec<ListingEntry>, usize)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut entries = Vec::new();
    let mut unparseable = 0;
    for line in lines {
        match parse_line(line) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(e) => {
                log::debug!("{}", e);
                unparseable += 1;
            }
        }
    }
    (entries, unparseable)
}

fn is_total_header(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(word), Some(count), None)
            if word.eq_ignore_ascii_case("total") && count.parse::<u64>().is_ok()
    )
}

fn parse_unix(line: &str) -> Option<ListingEntry> {
    let caps = unix_pattern().captures(line)?;
    let type_char = caps.get(1)?.as_str();
    let size = caps.get(2)?.as_str().parse::<u64>().ok();
    let raw_name = caps.get(3)?.as_str();

    let (kind, name) = match type_char {
        "d" => (EntryKind::Directory, raw_name),
        "l" => (
            EntryKind::Symlink,
            raw_name.split(" -> ").next().unwrap_or(raw_name),
        ),
        _ => (EntryKind::File, raw_name),
    };

    Some(ListingEntry {
        name: name.to_string(),
        kind,
        size: if kind == EntryKind::Directory { None } else { size },
    })
}

fn parse_dos(line: &str) -> Option<ListingEntry> {
    let caps = dos_pattern().captures(line)?;
    let name = caps.get(5)?.as_str().to_string();

    if caps.get(3).is_some() {
        Some(ListingEntry {
            name,
            kind: EntryKind::Directory,
            size: None,
        })
    } else {
        Some(ListingEntry {
            name,
            kind: EntryKind::File,
            size: caps.get(4).and_then(|m| m.as_str().parse().ok()),
        })
    }
}

fn parse_fallback(line: &str) -> Option<ListingEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }

    let name = parts.last()?.to_string();
    let kind = if line.starts_with('d') {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    let size = if kind == EntryKind::File && parts.len() >= 5 {
        parts[4].parse().ok()
    } else {
        None
    };

    Some(ListingEntry { name, kind, size })
}
