use netdupe::duplicates::{
    ChannelListener, ScanConfig, ScanEvent, ScanOrchestrator, ScanPhase, ScanResult, SpeedMode,
};
use netdupe::remote::memory::{MemoryConnector, MemoryServer};
use netdupe::remote::{
    ConnectionPool, CredentialProvider, Credentials, MultiplexerConfig, NoCredentials,
    PoolConfig, ScanRoot, StaticCredentials,
};
use netdupe::scanner::{Location, RemoteCollectorConfig, ScanError};
use netdupe::tasks::TaskPool;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn run(
    connector: MemoryConnector,
    credentials: Arc<dyn CredentialProvider>,
    config: ScanConfig,
    roots: Vec<ScanRoot>,
) -> (ScanPhase, Vec<ScanEvent>) {
    let tasks = Arc::new(TaskPool::new(4).unwrap());
    let connections = Arc::new(ConnectionPool::new(connector, PoolConfig::default()));
    let (listener, events) = ChannelListener::channel();
    let orchestrator =
        ScanOrchestrator::new(config, tasks, connections, credentials, Arc::new(listener));
    orchestrator.start_scan(roots, SpeedMode::Turbo).unwrap();
    let phase = orchestrator.wait().unwrap();
    (phase, events.try_iter().collect())
}

fn simple(server: &MemoryServer, config: ScanConfig, roots: &[&str]) -> (ScanPhase, Vec<ScanEvent>) {
    let roots = roots.iter().map(|r| ScanRoot::parse(r).unwrap()).collect();
    run(
        MemoryConnector::new(server.clone()),
        Arc::new(NoCredentials),
        config,
        roots,
    )
}

fn result_of(events: &[ScanEvent]) -> &ScanResult {
    events
        .iter()
        .find_map(|e| match e {
            ScanEvent::Completed(r) => Some(r.as_ref()),
            _ => None,
        })
        .expect("scan should complete")
}

fn fast_retries() -> ScanConfig {
    ScanConfig::default().with_multiplexer(MultiplexerConfig {
        max_backoff: Duration::from_millis(5),
        ..MultiplexerConfig::default()
    })
}

#[test]
fn test_remote_tree_is_collected_recursively() {
    let server = MemoryServer::new();
    server.add_file("/r.bin", 10);
    server.add_file("/a/one.bin", 11);
    server.add_file("/a/b/two.bin", 12);
    server.add_file("/a/b/c/three.bin", 13);

    let (phase, events) = simple(&server, ScanConfig::default(), &["ftp://mem/"]);
    assert_eq!(phase, ScanPhase::Completed);
    let result = result_of(&events);
    assert_eq!(result.stats.files_collected, 4);
    assert_eq!(
        result.sizes.get(&Location::remote("ftp://mem:21/a/b/c/three.bin")),
        Some(&13)
    );
}

#[test]
fn test_depth_limit_stops_descent() {
    let server = MemoryServer::new();
    server.add_file("/r.bin", 10);
    server.add_file("/a/one.bin", 11);
    server.add_file("/a/b/two.bin", 12);

    let config = ScanConfig::default().with_remote(RemoteCollectorConfig {
        max_depth: 1,
        ..RemoteCollectorConfig::default()
    });
    let (_, events) = simple(&server, config, &["ftp://mem/"]);
    assert_eq!(result_of(&events).stats.files_collected, 2);
}

#[test]
fn test_subdirectory_failure_keeps_root() {
    let server = MemoryServer::new();
    server.add_file("/ok/a.bin", 10);
    server.add_file("/bad/b.bin", 10);
    server.fail_directory("/bad");

    let (phase, events) = simple(&server, fast_retries(), &["ftp://mem/"]);
    assert_eq!(phase, ScanPhase::Completed);
    assert!(!events.iter().any(|e| matches!(e, ScanEvent::Error(_))));

    let result = result_of(&events);
    assert_eq!(result.stats.files_collected, 1);
    assert_eq!(result.stats.directories_failed, 1);
    assert_eq!(result.stats.roots_failed, 0);
}

#[test]
fn test_unparseable_lines_are_counted_and_skipped() {
    let server = MemoryServer::new();
    server.add_file("/a.bin", 10);
    server.add_raw_line("/", "garbage ???");

    let (_, events) = simple(&server, ScanConfig::default(), &["ftp://mem/"]);
    let result = result_of(&events);
    assert_eq!(result.stats.files_collected, 1);
    assert_eq!(result.stats.unparseable_lines, 1);
}

#[test]
fn test_mixed_roots_share_size_buckets() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("local.bin"), vec![0u8; 64]).unwrap();
    fs::write(dir.path().join("unique.bin"), vec![0u8; 65]).unwrap();

    let server = MemoryServer::new();
    server.add_file("/remote.bin", 64);

    let roots = vec![
        ScanRoot::Local(dir.path().to_path_buf()),
        ScanRoot::parse("ftp://mem/").unwrap(),
    ];
    let (_, events) = run(
        MemoryConnector::new(server.clone()),
        Arc::new(NoCredentials),
        ScanConfig::default(),
        roots,
    );
    let result = result_of(&events);
    assert_eq!(result.stats.files_collected, 3);
    assert_eq!(result.stats.candidates, 2);
    // Remote content is not readable, so the pair cannot be confirmed
    assert_eq!(result.stats.hash_failures, 1);
    assert!(result.groups.is_empty());
}

#[test]
fn test_connections_are_reused_across_listings() {
    let server = MemoryServer::new();
    for i in 0..40 {
        server.add_file(&format!("/d{i}/f.bin"), 100 + i);
    }

    let config = ScanConfig::default().with_transfer_connections(4);
    let (_, events) = simple(&server, config, &["ftp://mem/"]);
    assert_eq!(result_of(&events).stats.files_collected, 40);
    assert_eq!(server.lists(), 41);
    assert!(server.connects() <= 4, "connects = {}", server.connects());
    assert!(server.peak_sessions() <= 4);
}

#[test]
fn test_unreachable_remote_root_reports_error() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a"), b"same").unwrap();
    fs::write(dir.path().join("b"), b"same").unwrap();

    let server = MemoryServer::new();
    server.set_reachable(false);
    let roots = vec![
        ScanRoot::parse("ftp://mem/").unwrap(),
        ScanRoot::Local(dir.path().to_path_buf()),
    ];
    let (phase, events) = run(
        MemoryConnector::new(server.clone()),
        Arc::new(NoCredentials),
        fast_retries(),
        roots,
    );

    assert_eq!(phase, ScanPhase::Completed);
    assert!(events
        .iter()
        .any(|e| matches!(e, ScanEvent::Error(ScanError::RootUnreachable { .. }))));
    let result = result_of(&events);
    assert_eq!(result.groups.len(), 1);
    assert_eq!(result.root_errors.len(), 1);
}

#[test]
fn test_configured_credentials_allow_login() {
    let server = MemoryServer::new();
    server.add_file("/a.bin", 5);
    let connector = MemoryConnector::new(server.clone()).with_anonymous(false);
    let credentials = StaticCredentials::new().with("mem", 21, Credentials::new("user", "pw"));

    let (_, events) = run(
        connector,
        Arc::new(credentials),
        ScanConfig::default(),
        vec![ScanRoot::parse("ftp://mem/").unwrap()],
    );
    assert!(!events.iter().any(|e| matches!(e, ScanEvent::Error(_))));
    assert_eq!(result_of(&events).stats.files_collected, 1);
}

#[test]
fn test_missing_credentials_without_anonymous_login() {
    let server = MemoryServer::new();
    let connector = MemoryConnector::new(server.clone()).with_anonymous(false);

    let (_, events) = run(
        connector,
        Arc::new(NoCredentials),
        ScanConfig::default(),
        vec![ScanRoot::parse("ftp://mem/").unwrap()],
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, ScanEvent::Error(ScanError::MissingCredentials(_)))));
    assert_eq!(server.connects(), 0);
}
