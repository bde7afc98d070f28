//! Command-line interface definitions for netdupe.
//!
//! # Example
//!
//! ```bash
//! # Scan a local directory and an FTP share together
//! netdupe scan ~/Pictures ftp://nas.local/photos
//!
//! # Fastest mode, JSON report
//! netdupe scan /data --mode turbo --output json
//!
//! # Only files of at least 1 MiB, confirm quick-hash matches
//! netdupe -v scan /data --min-size 1MiB --confirm
//! ```

use bytesize::ByteSize;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::duplicates::{KeepPolicyKind, SpeedMode};

/// Duplicate file finder for local disks and FTP servers.
#[derive(Debug, Parser)]
#[command(name = "netdupe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (default: platform config dir)
    #[arg(long, value_name = "PATH", global = true, env = "NETDUPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan directories for duplicate files
    Scan(ScanArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

/// Arguments for the config subcommand.
#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Print the default config file location instead
    #[arg(long)]
    pub path: bool,
}

/// Arguments for the scan subcommand.
///
/// Options left unset fall back to the configuration file.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Roots to scan: local paths or `ftp://[user[:pass]@]host[:port]/path`
    #[arg(value_name = "ROOT", required = true, num_args = 1..)]
    pub roots: Vec<String>,

    /// Speed/accuracy trade-off
    #[arg(short, long, value_enum)]
    pub mode: Option<SpeedMode>,

    /// Worker threads (default: derived from the mode and core count)
    #[arg(short = 'j', long, value_name = "N")]
    pub threads: Option<usize>,

    /// Minimum file size to consider (e.g. 4096, 1KiB, 10 MB)
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub min_size: Option<u64>,

    /// Maximum remote directory depth below each root
    #[arg(long, value_name = "N")]
    pub max_depth: Option<usize>,

    /// Full-hash files whose quick hashes match before reporting them
    #[arg(long)]
    pub confirm: bool,

    /// Gitignore-style patterns to skip in local roots (repeatable)
    #[arg(short, long = "exclude", value_name = "PATTERN")]
    pub exclude_patterns: Vec<String>,

    /// Which file of each group to mark as the one to keep
    #[arg(long, value_enum, value_name = "POLICY")]
    pub keep: Option<KeepPolicyKind>,

    /// Report format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Report format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary
    Text,
    /// JSON document
    Json,
    /// One CSV row per file
    Csv,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Csv => write!(f, "csv"),
        }
    }
}

/// Parse a human-readable size into bytes.
///
/// Accepts plain byte counts and decimal or binary suffixes, case-insensitive.
///
/// ```
/// use netdupe::cli::parse_size;
///
/// assert_eq!(parse_size("4096").unwrap(), 4096);
/// assert_eq!(parse_size("1KiB").unwrap(), 1024);
/// assert_eq!(parse_size("2 MB").unwrap(), 2_000_000);
/// ```
///
/// # Errors
///
/// Returns an error message if the text is not a size.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Size cannot be empty".to_string());
    }
    if let Ok(bytes) = s.parse::<u64>() {
        return Ok(bytes);
    }
    s.parse::<ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|e| format!("Invalid size '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size(" 1024 ").unwrap(), 1024);
        assert_eq!(parse_size("1KiB").unwrap(), 1024);
        assert_eq!(parse_size("1MiB").unwrap(), 1_048_576);
        assert_eq!(parse_size("1 GB").unwrap(), 1_000_000_000);
    }

    #[test]
    fn test_parse_size_errors() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("-1").is_err());
    }

    #[test]
    fn test_cli_parse_scan_basic() {
        let cli = Cli::try_parse_from(["netdupe", "scan", "/some/path"]).unwrap();
        assert_eq!(cli.verbose, 0);
        let Commands::Scan(args) = cli.command else {
            panic!("Expected Scan command");
        };
        assert_eq!(args.roots, vec!["/some/path"]);
        assert_eq!(args.output, OutputFormat::Text);
        assert_eq!(args.mode, None);
        assert!(!args.confirm);
    }

    #[test]
    fn test_cli_parse_scan_with_options() {
        let cli = Cli::try_parse_from([
            "netdupe",
            "-v",
            "--json-errors",
            "scan",
            "/data",
            "ftp://nas/media",
            "--mode",
            "turbo",
            "-j",
            "12",
            "--min-size",
            "1MiB",
            "--max-depth",
            "4",
            "--confirm",
            "--exclude",
            "*.tmp",
            "--exclude",
            "cache/",
            "--keep",
            "shortest-path",
            "--output",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 1);
        assert!(cli.json_errors);
        let Commands::Scan(args) = cli.command else {
            panic!("Expected Scan command");
        };
        assert_eq!(args.roots, vec!["/data", "ftp://nas/media"]);
        assert_eq!(args.mode, Some(SpeedMode::Turbo));
        assert_eq!(args.threads, Some(12));
        assert_eq!(args.min_size, Some(1_048_576));
        assert_eq!(args.max_depth, Some(4));
        assert!(args.confirm);
        assert_eq!(args.exclude_patterns, vec!["*.tmp", "cache/"]);
        assert_eq!(args.keep, Some(KeepPolicyKind::ShortestPath));
        assert_eq!(args.output, OutputFormat::Json);
    }

    #[test]
    fn test_cli_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["netdupe", "-v", "-q", "scan", "/path"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_config_subcommand() {
        let cli = Cli::try_parse_from(["netdupe", "--config", "/tmp/n.toml", "config", "--path"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/n.toml")));
        assert!(matches!(cli.command, Commands::Config(ConfigArgs { path: true })));
    }

    #[test]
    fn test_cli_missing_root() {
        assert!(Cli::try_parse_from(["netdupe", "scan"]).is_err());
    }

    #[test]
    fn test_cli_invalid_mode() {
        assert!(Cli::try_parse_from(["netdupe", "scan", "/p", "--mode", "warp"]).is_err());
    }
}
