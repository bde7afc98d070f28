//! In-memory listing server.
//!
//! [`MemoryServer`] holds a virtual directory tree and renders Unix-style
//! listings for it. [`MemoryConnector`] opens sessions against it through the
//! regular [`Connector`] interface, so the pool, the multiplexer and the
//! orchestrator can be exercised without a network. The server can be made
//! unreachable, can drop every open session, and can slow listings down.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::connection::{ConnectionInfo, Connector, Timeouts, Transport, TransportError};
use crate::tasks::lock_unpoisoned;

#[derive(Debug, Clone)]
enum Node {
    File(u64),
    Dir,
    Raw(String),
}

#[derive(Debug, Default)]
struct ServerState {
    dirs: BTreeMap<String, BTreeMap<String, Node>>,
    failing: HashSet<String>,
    reachable: bool,
    epoch: u64,
    list_delay: Duration,
}

#[derive(Debug, Default)]
struct ServerCounters {
    connects: AtomicUsize,
    lists: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
}

/// Virtual remote file tree shared by every session opened against it.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    counters: Arc<ServerCounters>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// Create a reachable server with an empty root directory.
    #[must_use]
    pub fn new() -> Self {
        let mut state = ServerState {
            reachable: true,
            ..ServerState::default()
        };
        state.dirs.insert("/".to_string(), BTreeMap::new());
        Self {
            state: Arc::new(Mutex::new(state)),
            counters: Arc::new(ServerCounters::default()),
        }
    }

    /// Add a file, creating parent directories as needed.
    pub fn add_file(&self, path: &str, size: u64) {
        let (parent, name) = split_parent(path);
        let mut state = lock_unpoisoned(&self.state);
        ensure_dir(&mut state, &parent);
        if let Some(entries) = state.dirs.get_mut(&parent) {
            entries.insert(name, Node::File(size));
        }
    }

    /// Add an empty directory, creating parents as needed.
    pub fn add_dir(&self, path: &str) {
        let mut state = lock_unpoisoned(&self.state);
        ensure_dir(&mut state, &normalize(path));
    }

    /// Append a verbatim listing line to a directory.
    pub fn add_raw_line(&self, dir: &str, line: &str) {
        let dir = normalize(dir);
        let mut state = lock_unpoisoned(&self.state);
        ensure_dir(&mut state, &dir);
        if let Some(entries) = state.dirs.get_mut(&dir) {
            let key = format!("\u{0}raw{}", entries.len());
            entries.insert(key, Node::Raw(line.to_string()));
        }
    }

    /// Make listing `dir` fail with a protocol error.
    pub fn fail_directory(&self, dir: &str) {
        lock_unpoisoned(&self.state).failing.insert(normalize(dir));
    }

    /// Accept or refuse new connections.
    pub fn set_reachable(&self, reachable: bool) {
        lock_unpoisoned(&self.state).reachable = reachable;
    }

    /// Delay every listing by `delay`.
    pub fn set_list_delay(&self, delay: Duration) {
        lock_unpoisoned(&self.state).list_delay = delay;
    }

    /// Drop every open session; their next probe or listing fails.
    pub fn kill_sessions(&self) {
        lock_unpoisoned(&self.state).epoch += 1;
    }

    /// Number of successful logins.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Number of listings served.
    #[must_use]
    pub fn lists(&self) -> usize {
        self.counters.lists.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Highest number of sessions open at the same time.
    #[must_use]
    pub fn peak_sessions(&self) -> usize {
        self.counters.peak_open.load(Ordering::SeqCst)
    }

    fn render(&self, dir: &str, epoch: u64) -> Result<Vec<u8>, TransportError> {
        let (entries, delay) = {
            let state = lock_unpoisoned(&self.state);
            if state.epoch != epoch {
                return Err(TransportError::Io("connection reset by peer".to_string()));
            }
            if state.failing.contains(dir) {
                return Err(TransportError::Protocol(format!(
                    "550 {dir}: Permission denied"
                )));
            }
            let entries = state
                .dirs
                .get(dir)
                .cloned()
                .ok_or_else(|| TransportError::Protocol(format!("550 {dir}: No such directory")))?;
            (entries, state.list_delay)
        };

        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.counters.lists.fetch_add(1, Ordering::SeqCst);

        let mut out = String::new();
        for (name, node) in entries {
            let line = match node {
                Node::File(size) => {
                    format!("-rw-r--r--   1 owner    group {size:>12} Jan 01 12:00 {name}")
                }
                Node::Dir => {
                    format!("drwxr-xr-x   2 owner    group         4096 Jan 01 12:00 {name}")
                }
                Node::Raw(line) => line,
            };
            out.push_str(&line);
            out.push_str("\r\n");
        }
        Ok(out.into_bytes())
    }
}

/// Connector opening sessions on a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
    anonymous: bool,
}

impl MemoryConnector {
    /// Create a connector for `server` that accepts anonymous logins.
    #[must_use]
    pub fn new(server: MemoryServer) -> Self {
        Self {
            server,
            anonymous: true,
        }
    }

    /// Set whether anonymous login is allowed.
    #[must_use]
    pub fn with_anonymous(mut self, allowed: bool) -> Self {
        self.anonymous = allowed;
        self
    }

    /// The backing server.
    #[must_use]
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

impl Connector for MemoryConnector {
    type Transport = MemoryTransport;

    fn scheme(&self) -> &str {
        "ftp"
    }

    fn allows_anonymous(&self) -> bool {
        self.anonymous
    }

    fn connect(
        &self,
        info: &ConnectionInfo,
        _timeouts: &Timeouts,
    ) -> Result<MemoryTransport, TransportError> {
        let epoch = {
            let state = lock_unpoisoned(&self.server.state);
            if !state.reachable {
                return Err(TransportError::Connect {
                    target: info.address(),
                    reason: "connection refused".to_string(),
                });
            }
            state.epoch
        };

        let counters = &self.server.counters;
        counters.connects.fetch_add(1, Ordering::SeqCst);
        let open = counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_open.fetch_max(open, Ordering::SeqCst);

        Ok(MemoryTransport {
            server: self.server.clone(),
            epoch,
        })
    }
}

/// One session on a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryTransport {
    server: MemoryServer,
    epoch: u64,
}

impl Transport for MemoryTransport {
    fn probe(&mut self) -> Result<(), TransportError> {
        let state = lock_unpoisoned(&self.server.state);
        if state.epoch == self.epoch {
            Ok(())
        } else {
            Err(TransportError::Io("connection reset by peer".to_string()))
        }
    }

    fn list(&mut self, directory: &str) -> Result<Vec<u8>, TransportError> {
        self.server.render(&normalize(directory), self.epoch)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.server.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn split_parent(path: &str) -> (String, String) {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path),
    }
}

fn ensure_dir(state: &mut ServerState, dir: &str) {
    if state.dirs.contains_key(dir) {
        return;
    }
    state.dirs.insert(dir.to_string(), BTreeMap::new());
    if dir == "/" {
        return;
    }
    let (parent, name) = split_parent(dir);
    ensure_dir(state, &parent);
    if let Some(entries) = state.dirs.get_mut(&parent) {
        entries.insert(name, Node::Dir);
    }
}
