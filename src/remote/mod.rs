//! Remote file-server access.
//!
//! This module provides:
//! - Locator and credential handling for remote scan roots
//! - A keyed [`ConnectionPool`] of reusable transport sessions
//! - The [`ListingMultiplexer`], which drives hundreds of directory listings
//!   concurrently over a small number of pooled sessions
//! - A parser for the listing formats servers send back
//! - An FTP transport and an in-memory server for tests and benchmarks

pub mod connection;
pub mod credentials;
pub mod ftp;
pub mod listing;
pub mod locator;
pub mod memory;
pub mod multiplexer;
pub mod pool;
pub mod transfer;

pub use connection::{
    ConnectionInfo, ConnectionKey, Connector, PooledConnection, Timeouts, Transport,
    TransportError,
};
pub use credentials::{
    resolve_credentials, CredentialEntry, CredentialProvider, Credentials, NoCredentials,
    StaticCredentials,
};
pub use ftp::FtpConnector;
pub use listing::{EntryKind, ListingEntry, ListingParseError};
pub use locator::{LocatorError, RemoteLocator, ScanRoot};
pub use multiplexer::{ListingCompletion, ListingMultiplexer, ListingTarget, MultiplexerConfig};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolJanitor, PoolStats, StatsObserver};
pub use transfer::{MultiTransfer, PooledTransfers, TransferDone, TransferError, TransferRequest};
