use crossbeam_channel::Receiver;
use netdupe::duplicates::{
    ChannelListener, ListenerSet, ScanConfig, ScanEvent, ScanListener, ScanOrchestrator, ScanPhase,
    SpeedMode, StartStatus,
};
use netdupe::remote::memory::{MemoryConnector, MemoryServer};
use netdupe::remote::{ConnectionPool, NoCredentials, PoolConfig, ScanRoot};
use netdupe::tasks::TaskPool;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn orchestrator(
    server: &MemoryServer,
    tasks: &Arc<TaskPool>,
) -> (
    ScanOrchestrator<MemoryConnector>,
    Receiver<ScanEvent>,
) {
    let connections = Arc::new(ConnectionPool::new(
        MemoryConnector::new(server.clone()),
        PoolConfig::default(),
    ));
    let (listener, events) = ChannelListener::channel();
    let orchestrator = ScanOrchestrator::new(
        ScanConfig::default(),
        Arc::clone(tasks),
        connections,
        Arc::new(NoCredentials),
        Arc::new(listener),
    );
    (orchestrator, events)
}

#[test]
fn test_stop_during_remote_collection() {
    let server = MemoryServer::new();
    for i in 0..20 {
        server.add_file(&format!("/d{i}/f"), 1);
    }
    server.set_list_delay(Duration::from_millis(100));
    let tasks = Arc::new(TaskPool::new(2).unwrap());
    let (orchestrator, events) = orchestrator(&server, &tasks);

    orchestrator
        .start_scan(vec![ScanRoot::parse("ftp://mem/").unwrap()], SpeedMode::Balanced)
        .unwrap();
    thread::sleep(Duration::from_millis(30));

    let stopped_at = Instant::now();
    orchestrator.stop_scan();
    assert_eq!(orchestrator.wait(), Some(ScanPhase::Cancelled));
    assert!(stopped_at.elapsed() < Duration::from_secs(5));

    let events: Vec<ScanEvent> = events.try_iter().collect();
    assert!(!events.iter().any(|e| matches!(e, ScanEvent::Completed(_))));
    assert!(matches!(
        events.last(),
        Some(ScanEvent::PhaseChanged(ScanPhase::Cancelled))
    ));
    assert!(!events
        .iter()
        .any(|e| matches!(e, ScanEvent::PhaseChanged(ScanPhase::SizeFiltering))));
}

/// Occupies every worker once size filtering starts, so the hash batches
/// that follow stay queued until the gate sender is dropped.
struct GateListener {
    tasks: Arc<TaskPool>,
    gate: Receiver<()>,
}

impl ScanListener for GateListener {
    fn on_phase_changed(&self, phase: ScanPhase) {
        if phase != ScanPhase::SizeFiltering {
            return;
        }
        for _ in 0..self.tasks.size() {
            let gate = self.gate.clone();
            self.tasks
                .enqueue(move || {
                    let _ = gate.recv();
                })
                .unwrap();
        }
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_stop_drops_queued_hash_batches() {
    let dir = tempdir().unwrap();
    // Identical files: one size bucket, 4 full-hash batches of 100
    for i in 0..400 {
        fs::write(dir.path().join(format!("f{i}")), [7u8; 64]).unwrap();
    }
    let tasks = Arc::new(TaskPool::new(4).unwrap());
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
    let (channel, events) = ChannelListener::channel();
    let listener = ListenerSet::new().with(Arc::new(channel)).with(Arc::new(GateListener {
        tasks: Arc::clone(&tasks),
        gate: gate_rx,
    }));
    let orchestrator = ScanOrchestrator::new(
        ScanConfig::default(),
        Arc::clone(&tasks),
        Arc::new(ConnectionPool::new(
            MemoryConnector::new(MemoryServer::new()),
            PoolConfig::default(),
        )),
        Arc::new(NoCredentials),
        Arc::new(listener),
    );

    orchestrator
        .start_scan(vec![ScanRoot::Local(dir.path().to_path_buf())], SpeedMode::Accurate)
        .unwrap();
    wait_until("queued hash batches", || {
        tasks.active_count() == 4 && tasks.pending_count() >= 4
    });
    assert_eq!(orchestrator.phase(), ScanPhase::FullHashing);
    // Every worker is inside a gate task, so earlier tasks are all counted
    let baseline = tasks.completed_count();

    orchestrator.stop_scan();
    assert_eq!(tasks.pending_count(), 0);
    drop(gate_tx);
    assert_eq!(orchestrator.wait(), Some(ScanPhase::Cancelled));

    wait_until("gate tasks to finish", || tasks.active_count() == 0);
    // Only the gate tasks ran; no hash batch was started after the stop
    assert_eq!(tasks.completed_count(), baseline + 4);
    assert_eq!(tasks.pending_count(), 0);
    assert!(!events
        .try_iter()
        .any(|e| matches!(e, ScanEvent::Completed(_))));
}

#[test]
fn test_scan_can_restart_after_cancel() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a"), b"dup").unwrap();
    fs::write(dir.path().join("b"), b"dup").unwrap();

    let server = MemoryServer::new();
    server.set_list_delay(Duration::from_millis(200));
    let tasks = Arc::new(TaskPool::new(2).unwrap());
    let (orchestrator, events) = orchestrator(&server, &tasks);

    orchestrator
        .start_scan(vec![ScanRoot::parse("ftp://mem/").unwrap()], SpeedMode::Turbo)
        .unwrap();
    orchestrator.stop_scan();
    assert_eq!(orchestrator.wait(), Some(ScanPhase::Cancelled));
    let _: Vec<ScanEvent> = events.try_iter().collect();

    let status = orchestrator
        .start_scan(vec![ScanRoot::Local(dir.path().to_path_buf())], SpeedMode::Turbo)
        .unwrap();
    assert_eq!(status, StartStatus::Started);
    assert_eq!(orchestrator.wait(), Some(ScanPhase::Completed));
    assert!(events
        .try_iter()
        .any(|e| matches!(e, ScanEvent::Completed(ref r) if r.groups.len() == 1)));
}

#[test]
fn test_stop_without_scan_is_noop() {
    let server = MemoryServer::new();
    let tasks = Arc::new(TaskPool::new(1).unwrap());
    let (orchestrator, _events) = orchestrator(&server, &tasks);
    orchestrator.stop_scan();
    assert_eq!(orchestrator.phase(), ScanPhase::Idle);
    assert_eq!(orchestrator.wait(), None);
}
