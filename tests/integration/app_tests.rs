use clap::Parser;
use netdupe::cli::Cli;
use netdupe::error::ExitCode;
use netdupe::{run_app, AppError};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const FAST_CONFIG: &str = r#"
[pool]
connect_timeout_ms = 500

[remote]
retry_budget = 0
max_backoff_ms = 1
"#;

fn run(config: &Path, args: &[&str]) -> anyhow::Result<ExitCode> {
    let config = config.to_string_lossy().to_string();
    let mut argv = vec!["netdupe", "-q", "--config", config.as_str()];
    argv.extend_from_slice(args);
    run_app(Cli::try_parse_from(argv).unwrap())
}

#[test]
fn test_exit_code_success_with_duplicates() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), FAST_CONFIG).unwrap();
    let data = dir.path().join("data");
    fs::create_dir(&data).unwrap();
    fs::write(data.join("a.txt"), b"duplicate content").unwrap();
    fs::write(data.join("b.txt"), b"duplicate content").unwrap();

    let code = run(
        &dir.path().join("config.toml"),
        &["scan", data.to_str().unwrap(), "--output", "json"],
    )
    .unwrap();
    assert_eq!(code, ExitCode::Success);
}

#[test]
fn test_exit_code_no_duplicates() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), FAST_CONFIG).unwrap();
    let data = dir.path().join("data");
    fs::create_dir(&data).unwrap();
    fs::write(data.join("a.txt"), b"one").unwrap();
    fs::write(data.join("b.txt"), b"two!").unwrap();

    let code = run(&dir.path().join("config.toml"), &["scan", data.to_str().unwrap()]).unwrap();
    assert_eq!(code, ExitCode::NoDuplicates);
}

#[test]
fn test_exit_code_partial_success_with_unreachable_root() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), FAST_CONFIG).unwrap();
    let data = dir.path().join("data");
    fs::create_dir(&data).unwrap();
    fs::write(data.join("a.txt"), b"same").unwrap();
    fs::write(data.join("b.txt"), b"same").unwrap();

    let code = run(
        &dir.path().join("config.toml"),
        &[
            "scan",
            data.to_str().unwrap(),
            "ftp://127.0.0.1:1/",
            "--output",
            "csv",
        ],
    )
    .unwrap();
    assert_eq!(code, ExitCode::PartialSuccess);
}

#[test]
fn test_invalid_root_is_error() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), FAST_CONFIG).unwrap();

    let err = run(&dir.path().join("config.toml"), &["scan", "ftp://"]).unwrap_err();
    assert!(err.to_string().contains("Invalid scan root"));
    assert!(err.downcast_ref::<AppError>().is_none());
}

#[test]
fn test_missing_config_file_is_error() {
    let dir = tempdir().unwrap();
    let err = run(&dir.path().join("absent.toml"), &["scan", "/tmp"]).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to load configuration"));
}

#[test]
fn test_config_subcommand_succeeds() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), FAST_CONFIG).unwrap();
    let code = run(&dir.path().join("config.toml"), &["config"]).unwrap();
    assert_eq!(code, ExitCode::Success);
}
