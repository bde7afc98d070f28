//! netdupe - parallel duplicate file finder for local disks and FTP servers
//!
//! A scan collects files from any mix of local directories and remote
//! listings, discards files with a unique size, and confirms the rest by
//! content hash. See [`duplicates::ScanOrchestrator`] for the pipeline.

pub mod cli;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod logging;
pub mod output;
pub mod progress;
pub mod remote;
pub mod scanner;
pub mod signal;
pub mod tasks;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::RecvTimeoutError;

use crate::cli::{Cli, Commands, ConfigArgs, OutputFormat, ScanArgs};
use crate::config::Config;
use crate::duplicates::{
    ChannelListener, ListenerSet, ScanEvent, ScanOrchestrator, ScanPhase, ScanResult,
};
use crate::error::ExitCode;
use crate::output::{CsvOutput, JsonOutput, TextOutput};
use crate::progress::Progress;
use crate::remote::{ConnectionPool, FtpConnector, PoolJanitor, ScanRoot};
use crate::tasks::pool::default_thread_count;
use crate::tasks::TaskPool;

/// Application-level failures that map to a dedicated exit code.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    /// The scan was stopped by Ctrl+C.
    #[error("Scan interrupted")]
    Interrupted,
}

/// Interval at which the main thread checks for Ctrl+C.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run the command described by `cli` and return the process exit code.
///
/// # Errors
///
/// Returns an error for invalid configuration or roots, for resources that
/// cannot be created, for a failed scan, and [`AppError::Interrupted`] when
/// the scan was stopped by Ctrl+C.
pub fn run_app(cli: Cli) -> Result<ExitCode> {
    logging::init_logging(cli.verbose, cli.quiet);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    match cli.command {
        Commands::Scan(args) => run_scan(config, &args, cli.quiet),
        Commands::Config(args) => show_config(&config, &args),
    }
}

fn show_config(config: &Config, args: &ConfigArgs) -> Result<ExitCode> {
    if args.path {
        let path = Config::default_path().context("No configuration directory on this platform")?;
        println!("{}", path.display());
    } else {
        let mut shown = config.clone();
        for entry in &mut shown.credentials {
            entry.credentials.password = "********".to_string();
        }
        print!("{}", shown.to_toml()?);
    }
    Ok(ExitCode::Success)
}

fn run_scan(mut config: Config, args: &ScanArgs, quiet: bool) -> Result<ExitCode> {
    config.apply_scan_args(args);

    let roots = args
        .roots
        .iter()
        .map(|root| ScanRoot::parse(root))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid scan root")?;

    let shutdown = signal::install_handler()?;

    let mode = config.scan.mode;
    let threads = config.worker_threads(default_thread_count());
    log::info!("Mode: {} ({} worker threads)", mode, threads);
    if config.scan.min_size > 0 {
        log::info!("Size filter: min {}", bytesize::ByteSize(config.scan.min_size));
    }

    let tasks = Arc::new(TaskPool::new(threads).context("Failed to start worker threads")?);
    let connections = Arc::new(ConnectionPool::new(FtpConnector::new(), config.pool_config()));
    let _janitor = PoolJanitor::spawn(&connections).context("Failed to start pool janitor")?;

    let (channel, events) = ChannelListener::channel();
    let listeners = ListenerSet::new()
        .with(Arc::new(Progress::new(quiet)))
        .with(Arc::new(channel));

    let orchestrator = ScanOrchestrator::new(
        config.scan_config(),
        Arc::clone(&tasks),
        Arc::clone(&connections),
        Arc::new(config.credential_provider()),
        Arc::new(listeners),
    );
    orchestrator
        .start_scan(roots, mode)
        .context("Failed to start scan")?;

    let mut result: Option<ScanResult> = None;
    let mut failure: Option<String> = None;
    let mut record = |event: ScanEvent| match event {
        ScanEvent::Completed(done) => result = Some(*done),
        ScanEvent::Failed(reason) => failure = Some(reason),
        _ => {}
    };

    loop {
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(event) => record(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shutdown.is_shutdown_requested() {
            orchestrator.stop_scan();
        }
        if !orchestrator.is_scanning() {
            break;
        }
    }
    let phase = orchestrator.wait();
    events.try_iter().for_each(&mut record);

    let stats = connections.stats();
    log::debug!(
        "Connection pool: {} created, {} reused ({:.0}% reuse), {} closed",
        stats.created,
        stats.reused,
        stats.reuse_ratio() * 100.0,
        stats.closed
    );
    connections.close_all();

    match phase {
        Some(ScanPhase::Cancelled) => return Err(AppError::Interrupted.into()),
        Some(ScanPhase::Failed) => {
            bail!("Scan failed: {}", failure.unwrap_or_else(|| "unknown error".to_string()))
        }
        _ => {}
    }
    let Some(result) = result else {
        bail!("Scan ended without a result");
    };

    let exit_code = if result.stats.roots_failed > 0 {
        ExitCode::PartialSuccess
    } else if result.groups.is_empty() {
        ExitCode::NoDuplicates
    } else {
        ExitCode::Success
    };

    let stdout = io::stdout().lock();
    match args.output {
        OutputFormat::Text => TextOutput::new(&result).write_to(stdout)?,
        OutputFormat::Json => JsonOutput::new(&result, exit_code).write_to(stdout)?,
        OutputFormat::Csv => CsvOutput::new(&result.groups).write_to(stdout)?,
    }

    Ok(exit_code)
}
