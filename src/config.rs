//! Layered application configuration.
//!
//! Sources, lowest priority first:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. `config.toml` in the platform config directory, or the file passed
//!    with `--config`
//! 3. `NETDUPE_*` environment variables, nested keys split on `__`
//!    (e.g. `NETDUPE_SCAN__MODE=turbo`)
//! 4. Command-line flags ([`Config::apply_scan_args`])
//!
//! ```toml
//! [scan]
//! mode = "accurate"
//! min_size = 1048576
//!
//! [remote]
//! max_depth = 6
//!
//! [[credentials]]
//! host = "nas.local"
//! username = "media"
//! password = "secret"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::cli::ScanArgs;
use crate::duplicates::{KeepPolicyKind, ScanConfig, SpeedMode};
use crate::remote::{CredentialEntry, MultiplexerConfig, PoolConfig, StaticCredentials, Timeouts};
use crate::scanner::RemoteCollectorConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "NETDUPE_";

/// Configuration loading errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or did not match the schema.
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// `[scan]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSection {
    /// Speed mode
    pub mode: SpeedMode,
    /// Worker thread override; 0 derives the count from the mode
    pub threads: usize,
    /// Minimum candidate size in bytes
    pub min_size: u64,
    /// Full-hash quick-hash collisions
    pub confirm_quick_collisions: bool,
    /// Gitignore-style patterns skipped in local roots
    pub exclude_patterns: Vec<String>,
    /// Progress report interval
    pub progress_interval_ms: u64,
    /// Keep policy
    pub keep_policy: KeepPolicyKind,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            mode: SpeedMode::default(),
            threads: 0,
            min_size: 0,
            confirm_quick_collisions: false,
            exclude_patterns: Vec::new(),
            progress_interval_ms: 100,
            keep_policy: KeepPolicyKind::default(),
        }
    }
}

/// `[pool]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Idle connections kept per server and user
    pub max_connections: usize,
    /// TCP connect and response deadline
    pub connect_timeout_ms: u64,
    /// Idle time before a pooled connection is closed
    pub idle_timeout_secs: u64,
    /// Interval between idle sweeps
    pub cleanup_interval_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_ms: 30_000,
            idle_timeout_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

/// `[remote]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    /// Multiplexer step interval
    pub tick_ms: u64,
    /// Per-listing deadline
    pub request_timeout_secs: u64,
    /// Time a root may go without progress
    pub watchdog_secs: u64,
    /// Deepest directory level listed below a root
    pub max_depth: usize,
    /// Listing requests in flight at most
    pub max_outstanding: usize,
    /// Concurrent listing connections
    pub transfer_connections: usize,
    /// Retry retryable failures
    pub auto_reconnect: bool,
    /// Retries per listing
    pub retry_budget: u32,
    /// Backoff cap
    pub max_backoff_ms: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            request_timeout_secs: 30,
            watchdog_secs: 300,
            max_depth: 10,
            max_outstanding: 300,
            transfer_connections: 24,
            auto_reconnect: true,
            retry_budget: 3,
            max_backoff_ms: 5000,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scan behavior
    pub scan: ScanSection,
    /// Connection pool
    pub pool: PoolSection,
    /// Remote traversal
    pub remote: RemoteSection,
    /// Per-server credentials
    pub credentials: Vec<CredentialEntry>,
}

impl Config {
    /// Load defaults, the config file and the environment.
    ///
    /// A missing default config file is not an error; an explicit `path`
    /// that does not exist is.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a source is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::figment(path)?
            .extract()
            .map_err(|e| ConfigError::Invalid(Box::new(e)))
    }

    /// The layered figment behind [`Config::load`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if an explicit `path` does not exist.
    pub fn figment(path: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::Invalid(Box::new(figment::Error::from(format!(
                        "config file not found: {}",
                        path.display()
                    )))));
                }
                log::debug!("Loading config from {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if let Some(default) = Self::default_path().filter(|p| p.exists()) {
                    log::debug!("Loading config from {}", default.display());
                    figment = figment.merge(Toml::file(default));
                }
            }
        }

        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Platform-specific `config.toml` location.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "netdupe", "netdupe").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Render as a TOML document loadable with [`Config::load`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if a value has no TOML form.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Override settings with flags given on the command line.
    pub fn apply_scan_args(&mut self, args: &ScanArgs) {
        if let Some(mode) = args.mode {
            self.scan.mode = mode;
        }
        if let Some(threads) = args.threads {
            self.scan.threads = threads;
        }
        if let Some(min_size) = args.min_size {
            self.scan.min_size = min_size;
        }
        if let Some(depth) = args.max_depth {
            self.remote.max_depth = depth;
        }
        if args.confirm {
            self.scan.confirm_quick_collisions = true;
        }
        if let Some(keep) = args.keep {
            self.scan.keep_policy = keep;
        }
        self.scan
            .exclude_patterns
            .extend(args.exclude_patterns.iter().cloned());
    }

    /// Worker threads for a scan on a machine with `cores` hardware threads.
    #[must_use]
    pub fn worker_threads(&self, cores: usize) -> usize {
        if self.scan.threads > 0 {
            self.scan.threads
        } else {
            self.scan.mode.recommended_threads(cores)
        }
    }

    /// Orchestrator settings.
    #[must_use]
    pub fn scan_config(&self) -> ScanConfig {
        let remote = &self.remote;
        ScanConfig::default()
            .with_min_size(self.scan.min_size)
            .with_confirm_quick_collisions(self.scan.confirm_quick_collisions)
            .with_exclude_patterns(self.scan.exclude_patterns.clone())
            .with_progress_interval(Duration::from_millis(self.scan.progress_interval_ms))
            .with_keep_policy(self.scan.keep_policy.into())
            .with_multiplexer(MultiplexerConfig {
                tick: Duration::from_millis(remote.tick_ms.max(1)),
                request_timeout: Duration::from_secs(remote.request_timeout_secs),
                auto_reconnect: remote.auto_reconnect,
                retry_budget: remote.retry_budget,
                max_backoff: Duration::from_millis(remote.max_backoff_ms),
            })
            .with_remote(RemoteCollectorConfig {
                max_depth: remote.max_depth,
                max_outstanding: remote.max_outstanding.max(1),
                watchdog: Duration::from_secs(remote.watchdog_secs),
            })
            .with_transfer_connections(remote.transfer_connections)
    }

    /// Connection pool settings.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        let timeout = Duration::from_millis(self.pool.connect_timeout_ms);
        PoolConfig::default()
            .with_max_connections(self.pool.max_connections)
            .with_timeouts(Timeouts {
                connect: timeout,
                response: timeout,
            })
            .with_idle_timeout(Duration::from_secs(self.pool.idle_timeout_secs))
            .with_cleanup_interval(Duration::from_secs(self.pool.cleanup_interval_secs))
    }

    /// Credential table built from `[[credentials]]` entries.
    #[must_use]
    pub fn credential_provider(&self) -> StaticCredentials {
        StaticCredentials::from_entries(&self.credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duplicates::KeepPolicy;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .extract()
            .unwrap();
        assert_eq!(config.scan.mode, SpeedMode::Balanced);
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.remote.max_outstanding, 300);
        assert!(config.credentials.is_empty());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[scan]
mode = "accurate"
min_size = 4096

[remote]
max_depth = 3

[[credentials]]
host = "nas.local"
username = "media"
password = "pw"
"#,
        )
        .unwrap();

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(&path))
            .extract()
            .unwrap();
        assert_eq!(config.scan.mode, SpeedMode::Accurate);
        assert_eq!(config.scan.min_size, 4096);
        assert_eq!(config.scan.progress_interval_ms, 100);
        assert_eq!(config.remote.max_depth, 3);
        assert_eq!(config.credentials.len(), 1);
        assert_eq!(config.credentials[0].port, 21);
        assert_eq!(config.credential_provider().len(), 1);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("absent.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_conversions() {
        let mut config = Config::default();
        config.scan.keep_policy = KeepPolicyKind::ShortestPath;
        config.pool.connect_timeout_ms = 500;
        config.remote.retry_budget = 7;

        let scan = config.scan_config();
        assert!(matches!(scan.keep_policy, KeepPolicy::ShortestPath));
        assert_eq!(scan.multiplexer.retry_budget, 7);
        assert_eq!(scan.transfer_connections, 24);

        let pool = config.pool_config();
        assert_eq!(pool.timeouts.connect, Duration::from_millis(500));
        assert_eq!(pool.max_connections, 10);
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.scan.mode = SpeedMode::Turbo;
        config.remote.max_outstanding = 50;
        fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(&path))
            .extract()
            .unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_worker_threads() {
        let mut config = Config::default();
        config.scan.mode = SpeedMode::Turbo;
        assert_eq!(config.worker_threads(2), 10);
        config.scan.threads = 3;
        assert_eq!(config.worker_threads(2), 3);
    }
}
