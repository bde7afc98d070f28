//! Remote connection primitives.
//!
//! A [`Connector`] opens authenticated [`Transport`] handles for one protocol.
//! The transport value *is* the native resource: dropping it is the only way
//! the underlying socket gets closed. [`PooledConnection`] wraps one transport
//! together with the bookkeeping the [`ConnectionPool`](super::ConnectionPool)
//! needs.

use std::fmt;
use std::time::{Duration, Instant};

use super::credentials::Credentials;

/// Errors raised by a transport or connector.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// TCP connection could not be established.
    #[error("Connection to {target} failed: {reason}")]
    Connect {
        /// `host:port` that was dialed
        target: String,
        /// Underlying error text
        reason: String,
    },

    /// The server rejected the credentials.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// A connect or response deadline elapsed.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The server sent something the client did not expect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A socket read or write failed mid-operation.
    #[error("I/O error: {0}")]
    Io(String),

    /// The connection handle was already released.
    #[error("Connection is closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the operation on a fresh connection can help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout(_) | Self::Io(_))
    }

    /// Classify a socket error.
    #[must_use]
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(format!("{context}: {err}"))
            }
            _ => Self::Io(format!("{context}: {err}")),
        }
    }
}

/// Connect and response deadlines applied to new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for establishing the TCP connection
    pub connect: Duration,
    /// Deadline for each server response
    pub response: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            response: Duration::from_secs(30),
        }
    }
}

/// Where and as whom to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Login name
    pub username: String,
    /// Login password
    pub password: String,
}

impl ConnectionInfo {
    /// Create connection info for a server and credentials.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            username: credentials.username,
            password: credentials.password,
        }
    }

    /// Stable pool partition key for this target and identity.
    #[must_use]
    pub fn key(&self) -> ConnectionKey {
        // The password takes part in the key without being stored in it.
        let digest = blake3::hash(self.password.as_bytes()).to_hex();
        ConnectionKey(format!(
            "{}@{}:{}#{}",
            self.username,
            self.host.to_ascii_lowercase(),
            self.port,
            &digest.as_str()[..8]
        ))
    }

    /// `host:port` for display and dialing.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identifies one partition of the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    /// The key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An open, authenticated connection to a remote server.
///
/// Implementations close the native handle in `Drop`.
pub trait Transport: Send + 'static {
    /// Cheap liveness check (e.g. FTP `NOOP`).
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not answer as expected.
    fn probe(&mut self) -> Result<(), TransportError>;

    /// Fetch the raw textual listing of `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    fn list(&mut self, directory: &str) -> Result<Vec<u8>, TransportError>;
}

/// Factory for [`Transport`] handles of one protocol.
pub trait Connector: Send + Sync + 'static {
    /// Transport type produced by this connector.
    type Transport: Transport;

    /// URL scheme served by this connector (e.g. `"ftp"`).
    fn scheme(&self) -> &str;

    /// Whether the protocol supports anonymous login.
    fn allows_anonymous(&self) -> bool {
        true
    }

    /// Open and authenticate a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or rejects the login.
    fn connect(
        &self,
        info: &ConnectionInfo,
        timeouts: &Timeouts,
    ) -> Result<Self::Transport, TransportError>;
}

/// One transport handle owned by the pool or checked out by a caller.
///
/// The handle is present exactly while the connection is valid; invalidating
/// drops (and thereby closes) it.
pub struct PooledConnection<T: Transport> {
    key: ConnectionKey,
    handle: Option<T>,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
}

impl<T: Transport> PooledConnection<T> {
    pub(crate) fn new(key: ConnectionKey, handle: T) -> Self {
        let now = Instant::now();
        Self {
            key,
            handle: Some(handle),
            created_at: now,
            last_used: now,
            in_use: false,
        }
    }

    /// Pool partition this connection belongs to.
    #[must_use]
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Whether the native handle is still open.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether the connection is checked out.
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// Time since the connection was last handed out or returned.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Time since the connection was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Close the native handle. The connection stays around as an empty
    /// shell until the pool destroys it.
    pub fn invalidate(&mut self) {
        self.handle = None;
    }

    /// Run the liveness probe, invalidating the connection on failure.
    ///
    /// # Errors
    ///
    /// Returns the probe error, or [`TransportError::Closed`] if already invalid.
    pub fn probe(&mut self) -> Result<(), TransportError> {
        let result = match self.handle.as_mut() {
            Some(handle) => handle.probe(),
            None => Err(TransportError::Closed),
        };
        if result.is_err() {
            self.invalidate();
        }
        result
    }

    /// List a directory over this connection.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or [`TransportError::Closed`] if invalid.
    pub fn list(&mut self, directory: &str) -> Result<Vec<u8>, TransportError> {
        match self.handle.as_mut() {
            Some(handle) => handle.list(directory),
            None => Err(TransportError::Closed),
        }
    }

    pub(crate) fn check_out(&mut self) {
        self.in_use = true;
        self.last_used = Instant::now();
    }

    pub(crate) fn check_in(&mut self) {
        self.in_use = false;
        self.last_used = Instant::now();
    }
}

impl<T: Transport> fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("valid", &self.is_valid())
            .field("in_use", &self.in_use)
            .field("idle_for", &self.idle_for())
            .finish()
    }
}
