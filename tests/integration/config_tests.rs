use clap::Parser;
use figment::providers::{Env, Serialized};
use figment::Figment;
use netdupe::cli::{Cli, Commands, ScanArgs};
use netdupe::config::{Config, ENV_PREFIX};
use netdupe::duplicates::{KeepPolicyKind, SpeedMode};
use std::fs;
use tempfile::tempdir;

fn scan_args(extra: &[&str]) -> ScanArgs {
    let mut argv = vec!["netdupe", "scan", "/data"];
    argv.extend_from_slice(extra);
    let Commands::Scan(args) = Cli::try_parse_from(argv).unwrap().command else {
        panic!("Expected Scan command");
    };
    args
}

#[test]
fn test_config_load_from_env() {
    // Keys here are not read by any other test
    std::env::set_var("NETDUPE_POOL__IDLE_TIMEOUT_SECS", "7");
    std::env::set_var("NETDUPE_REMOTE__MAX_OUTSTANDING", "12");

    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .unwrap();

    assert_eq!(config.pool.idle_timeout_secs, 7);
    assert_eq!(config.remote.max_outstanding, 12);

    std::env::remove_var("NETDUPE_POOL__IDLE_TIMEOUT_SECS");
    std::env::remove_var("NETDUPE_REMOTE__MAX_OUTSTANDING");
}

#[test]
fn test_config_file_loads_through_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("netdupe.toml");
    fs::write(
        &path,
        r#"
[scan]
mode = "turbo"
keep_policy = "shortest_path"
exclude_patterns = ["*.tmp"]

[pool]
max_connections = 4
"#,
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.scan.mode, SpeedMode::Turbo);
    assert_eq!(config.scan.keep_policy, KeepPolicyKind::ShortestPath);
    assert_eq!(config.pool.max_connections, 4);
    assert_eq!(config.pool_config().max_connections, 4);
}

#[test]
fn test_malformed_file_is_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[scan]\nmode = \"warp\"\n").unwrap();

    let err = Config::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("Invalid configuration"));
}

#[test]
fn test_cli_flags_override_file() {
    let mut config = Config::default();
    config.scan.mode = SpeedMode::Accurate;
    config.scan.min_size = 10;
    config.scan.exclude_patterns = vec!["*.tmp".to_string()];

    let args = scan_args(&[
        "--mode",
        "turbo",
        "--min-size",
        "1KiB",
        "--max-depth",
        "2",
        "--confirm",
        "--exclude",
        "cache/",
    ]);
    config.apply_scan_args(&args);

    assert_eq!(config.scan.mode, SpeedMode::Turbo);
    assert_eq!(config.scan.min_size, 1024);
    assert_eq!(config.remote.max_depth, 2);
    assert!(config.scan.confirm_quick_collisions);
    assert_eq!(config.scan.exclude_patterns, vec!["*.tmp", "cache/"]);

    let scan = config.scan_config();
    assert_eq!(scan.min_size, 1024);
    assert_eq!(scan.remote.max_depth, 2);
    assert!(scan.confirm_quick_collisions);
}

#[test]
fn test_unset_flags_keep_file_values() {
    let mut config = Config::default();
    config.scan.mode = SpeedMode::Accurate;
    config.scan.threads = 6;
    config.remote.max_depth = 4;

    config.apply_scan_args(&scan_args(&[]));

    assert_eq!(config.scan.mode, SpeedMode::Accurate);
    assert_eq!(config.worker_threads(64), 6);
    assert_eq!(config.remote.max_depth, 4);
    assert!(!config.scan.confirm_quick_collisions);
}

#[test]
fn test_credentials_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("creds.toml");
    fs::write(
        &path,
        r#"
[[credentials]]
host = "nas.local"
port = 2121
username = "media"
password = "secret"

[[credentials]]
host = "backup"
username = "ops"
password = "hunter2"
"#,
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.credentials.len(), 2);
    assert_eq!(config.credentials[0].port, 2121);
    assert_eq!(config.credentials[1].port, 21);
    assert_eq!(config.credential_provider().len(), 2);
}
