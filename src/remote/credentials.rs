//! Credential lookup for remote roots.
//!
//! Credential storage lives outside the pipeline. The orchestrator only asks a
//! [`CredentialProvider`] for the user name and password of a `(host, port)`
//! pair and falls back to anonymous login when the protocol allows it.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// User name and password for a remote server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login name
    pub username: String,
    /// Login password
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    /// Create credentials from a user name and password.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Conventional anonymous FTP login.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new("anonymous", "anonymous@")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of stored credentials.
pub trait CredentialProvider: Send + Sync {
    /// Look up credentials for a server, or `None` if nothing is stored.
    fn lookup(&self, host: &str, port: u16) -> Option<Credentials>;
}

/// Provider that never has credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn lookup(&self, _host: &str, _port: u16) -> Option<Credentials> {
        None
    }
}

/// One `[[credentials]]` entry from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    /// Server host name or address
    pub host: String,
    /// Server port (defaults to 21)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Credentials for this server
    #[serde(flatten)]
    pub credentials: Credentials,
}

fn default_port() -> u16 {
    21
}

/// In-memory credential table keyed by `(host, port)`.
///
/// Host names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<(String, u16), Credentials>,
}

impl StaticCredentials {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the credentials for a server.
    pub fn insert(&mut self, host: &str, port: u16, credentials: Credentials) {
        self.entries
            .insert((host.to_ascii_lowercase(), port), credentials);
    }

    /// Builder-style [`StaticCredentials::insert`].
    #[must_use]
    pub fn with(mut self, host: &str, port: u16, credentials: Credentials) -> Self {
        self.insert(host, port, credentials);
        self
    }

    /// Build a table from configuration entries. Later entries win.
    #[must_use]
    pub fn from_entries(entries: &[CredentialEntry]) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.insert(&entry.host, entry.port, entry.credentials.clone());
        }
        table
    }

    /// Number of stored servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CredentialProvider for StaticCredentials {
    fn lookup(&self, host: &str, port: u16) -> Option<Credentials> {
        self.entries
            .get(&(host.to_ascii_lowercase(), port))
            .cloned()
    }
}

/// Pick the credentials for a remote root.
///
/// Credentials embedded in the locator win, then the provider, then anonymous
/// login if the protocol allows it. `None` means the root cannot be scanned.
#[must_use]
pub fn resolve_credentials(
    embedded: Option<Credentials>,
    provider: &dyn CredentialProvider,
    host: &str,
    port: u16,
    allows_anonymous: bool,
) -> Option<Credentials> {
    if let Some(credentials) = embedded {
        return Some(credentials);
    }
    if let Some(credentials) = provider.lookup(host, port) {
        log::debug!("Using stored credentials for {}:{}", host, port);
        return Some(credentials);
    }
    if allows_anonymous {
        log::debug!("No stored credentials for {}:{}, using anonymous login", host, port);
        Some(Credentials::anonymous())
    } else {
        None
    }
}
