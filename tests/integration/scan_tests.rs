use netdupe::duplicates::{
    ChannelListener, KeepPolicy, ScanConfig, ScanEvent, ScanOrchestrator, ScanPhase, ScanResult,
    SpeedMode,
};
use netdupe::remote::memory::{MemoryConnector, MemoryServer};
use netdupe::remote::{ConnectionPool, NoCredentials, PoolConfig, ScanRoot};
use netdupe::scanner::Location;
use netdupe::tasks::TaskPool;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn scan(roots: &[&Path], mode: SpeedMode, config: ScanConfig) -> (ScanPhase, Vec<ScanEvent>) {
    let tasks = Arc::new(TaskPool::new(4).unwrap());
    let connections = Arc::new(ConnectionPool::new(
        MemoryConnector::new(MemoryServer::new()),
        PoolConfig::default(),
    ));
    let (listener, events) = ChannelListener::channel();
    let orchestrator = ScanOrchestrator::new(
        config,
        tasks,
        connections,
        Arc::new(NoCredentials),
        Arc::new(listener),
    );
    let roots = roots
        .iter()
        .map(|p| ScanRoot::Local(p.to_path_buf()))
        .collect();
    orchestrator.start_scan(roots, mode).unwrap();
    let phase = orchestrator.wait().unwrap();
    (phase, events.try_iter().collect())
}

fn result_of(events: Vec<ScanEvent>) -> ScanResult {
    events
        .into_iter()
        .find_map(|e| match e {
            ScanEvent::Completed(r) => Some(*r),
            _ => None,
        })
        .expect("scan should complete")
}

#[test]
fn test_scan_empty_directory() {
    let dir = tempdir().unwrap();
    let (phase, events) = scan(&[dir.path()], SpeedMode::Balanced, ScanConfig::default());

    assert_eq!(phase, ScanPhase::Completed);
    let result = result_of(events);
    assert!(result.groups.is_empty());
    assert_eq!(result.stats.files_collected, 0);
}

#[test]
fn test_scan_nested_directories() {
    let dir = tempdir().unwrap();
    let deep = dir.path().join("a").join("b").join("c");
    fs::create_dir_all(&deep).unwrap();
    fs::write(dir.path().join("top.txt"), b"same content").unwrap();
    fs::write(deep.join("bottom.txt"), b"same content").unwrap();
    fs::write(deep.join("other.txt"), b"other content").unwrap();

    let (_, events) = scan(&[dir.path()], SpeedMode::Accurate, ScanConfig::default());
    let result = result_of(events);

    assert_eq!(result.groups.len(), 1);
    assert_eq!(
        result.groups[0].members,
        vec![
            Location::local(deep.join("bottom.txt")),
            Location::local(dir.path().join("top.txt")),
        ]
    );
    assert_eq!(result.stats.files_collected, 3);
}

#[test]
fn test_overlapping_roots_count_files_once() {
    let dir = tempdir().unwrap();
    let sub = dir.path().join("sub");
    fs::create_dir(&sub).unwrap();
    fs::write(sub.join("a"), b"xyz").unwrap();
    fs::write(dir.path().join("b"), b"xyz").unwrap();

    let (_, events) = scan(&[dir.path(), &sub], SpeedMode::Turbo, ScanConfig::default());
    let result = result_of(events);

    assert_eq!(result.stats.files_collected, 2);
    assert_eq!(result.groups.len(), 1);
    assert_eq!(result.groups[0].len(), 2);
}

#[test]
fn test_groups_across_separate_roots() {
    let left = tempdir().unwrap();
    let right = tempdir().unwrap();
    fs::write(left.path().join("photo.jpg"), vec![7u8; 20_000]).unwrap();
    fs::write(right.path().join("copy.jpg"), vec![7u8; 20_000]).unwrap();

    let (_, events) = scan(
        &[left.path(), right.path()],
        SpeedMode::Balanced,
        ScanConfig::default(),
    );
    let result = result_of(events);
    assert_eq!(result.groups.len(), 1);
    assert_eq!(result.wasted_space(), 20_000);
}

#[test]
fn test_min_size_excludes_small_files() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("s1"), b"tiny").unwrap();
    fs::write(dir.path().join("s2"), b"tiny").unwrap();
    fs::write(dir.path().join("l1"), vec![1u8; 4096]).unwrap();
    fs::write(dir.path().join("l2"), vec![1u8; 4096]).unwrap();

    let config = ScanConfig::default().with_min_size(1024);
    let (_, events) = scan(&[dir.path()], SpeedMode::Accurate, config);
    let result = result_of(events);

    assert_eq!(result.groups.len(), 1);
    assert_eq!(result.groups[0].size, 4096);
    assert_eq!(result.stats.candidates, 2);
}

#[test]
fn test_empty_files_are_never_duplicates() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("e1"), b"").unwrap();
    fs::write(dir.path().join("e2"), b"").unwrap();

    let (_, events) = scan(&[dir.path()], SpeedMode::Turbo, ScanConfig::default());
    let result = result_of(events);
    assert_eq!(result.stats.files_collected, 2);
    assert!(result.groups.is_empty());
}

#[test]
fn test_exclude_patterns_skip_directories() {
    let dir = tempdir().unwrap();
    let skipped = dir.path().join("node_modules");
    fs::create_dir(&skipped).unwrap();
    fs::write(dir.path().join("a"), b"dup").unwrap();
    fs::write(skipped.join("a"), b"dup").unwrap();

    let config = ScanConfig::default().with_exclude_patterns(vec!["node_modules/".to_string()]);
    let (_, events) = scan(&[dir.path()], SpeedMode::Accurate, config);
    let result = result_of(events);
    assert_eq!(result.stats.files_collected, 1);
    assert!(result.groups.is_empty());
}

#[test]
fn test_missing_local_root_is_reported_and_scan_completes() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");
    fs::write(dir.path().join("a"), b"dup").unwrap();
    fs::write(dir.path().join("b"), b"dup").unwrap();

    let (phase, events) = scan(
        &[&missing, dir.path()],
        SpeedMode::Accurate,
        ScanConfig::default(),
    );
    assert_eq!(phase, ScanPhase::Completed);
    assert!(events.iter().any(|e| matches!(
        e,
        ScanEvent::Error(netdupe::scanner::ScanError::RootNotFound(_))
    )));
    let result = result_of(events);
    assert_eq!(result.stats.roots_failed, 1);
    assert_eq!(result.groups.len(), 1);
}

#[test]
fn test_lexicographic_keep_policy() {
    let dir = tempdir().unwrap();
    for name in ["c", "a", "b"] {
        fs::write(dir.path().join(name), b"same").unwrap();
    }
    let config = ScanConfig::default().with_keep_policy(KeepPolicy::FirstLexicographic);
    let (_, events) = scan(&[dir.path()], SpeedMode::Accurate, config);
    let result = result_of(events);
    assert_eq!(
        result.groups[0].canonical(),
        Some(&Location::local(dir.path().join("a")))
    );
}

#[test]
fn test_progress_reports_hashing_totals() {
    let dir = tempdir().unwrap();
    for i in 0..20 {
        fs::write(dir.path().join(format!("f{i}")), b"0123456789").unwrap();
    }
    let (_, events) = scan(&[dir.path()], SpeedMode::Turbo, ScanConfig::default());

    let last_hash_progress = events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Progress {
                processed, total, ..
            } if *total > 0 => Some((*processed, *total)),
            _ => None,
        })
        .last();
    assert_eq!(last_hash_progress, Some((20, 20)));
}
