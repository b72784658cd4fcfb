//! Error types for linkwatch.
//!
//! Each layer has its own error enum; [`Error`] wraps them all so callers
//! that do not care about the layer can use `?` throughout.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for linkwatch operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport and jump chain errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// One-shot command errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Interactive shell errors
    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),

    /// Log stream rotation errors
    #[error("Rotation error: {0}")]
    Rotation(#[from] RotationError),

    /// Sampling worker errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Output parser errors
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Scan orchestration errors
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),
}

/// Transport layer errors (hop connection, authentication, liveness).
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Authentication was rejected by a hop
    #[error("Authentication failed for '{user}' on {host}")]
    AuthFailure { user: String, host: String },

    /// Connecting or authenticating timed out
    #[error("Connection to {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    /// SSH handshake, channel or forwarding failure
    #[error("Protocol error on {host}: {message}")]
    ProtocolError { host: String, message: String },

    /// The transport closed or never became active
    #[error("Transport to {host} is not active")]
    TransportInactive { host: String },

    /// Operation needs a connected tunnel
    #[error("Tunnel not connected - call connect() first")]
    NotConnected,

    /// Private key could not be loaded
    #[error("SSH key error: {0}")]
    Key(String),

    /// Host key differs from the known_hosts entry
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// Host is not in known_hosts and verification is strict
    #[error("Host key for {host}:{port} is unknown")]
    HostKeyUnknown { host: String, port: u16 },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Raw SSH error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Errors attached to a structured [`CommandResult`](crate::exec::CommandResult).
///
/// These are values, not failures propagated with `?`: the executor never
/// returns them through `Err`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Remote command exited with a non-zero status
    #[error("Command exited with status {code}")]
    NonZeroExit { code: i32 },

    /// No connected tunnel to run the command on
    #[error("No connection")]
    NoConnection,

    /// Command did not finish within its timeout
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Channel failed while the command was running
    #[error("Channel failure: {0}")]
    Channel(String),
}

/// Interactive shell errors.
#[derive(Error, Debug)]
pub enum ShellError {
    /// Prompt was not detected and output kept arriving until the deadline
    #[error("Prompt not found within {0:?}")]
    PromptTimeout(Duration),

    /// Shell is not open
    #[error("Shell not open - call open() first")]
    NotOpen,

    /// Shell channel closed by the remote side
    #[error("Shell channel closed")]
    Closed,

    /// Shell channel I/O failed
    #[error("Shell channel error: {0}")]
    Channel(String),

    /// Invalid prompt pattern
    #[error("Invalid prompt pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Log stream rotation errors.
#[derive(Error, Debug)]
pub enum RotationError {
    /// A log file could not be opened, truncated or written
    #[error("Log file I/O on {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The blocking write task panicked or was cancelled
    #[error("Log writer failed: {0}")]
    Writer(String),
}

/// Sampling worker errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Worker gave up after too many consecutive failures
    #[error("Worker '{source_id}' exceeded {limit} reconnect attempts")]
    ReconnectLimitExceeded { source_id: String, limit: u32 },
}

/// Output parser error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    /// Create a parse error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Scan orchestration errors.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The management CLI query did not yield a port id
    #[error("No port mapping found for interface '{interface}'")]
    PortNotFound { interface: String },

    /// The sub-CLI query did not yield an ASIC port name
    #[error("No ASIC port found for port '{port}'")]
    AsicPortNotFound { port: String },

    /// Device reported a failure marker in shell output
    #[error("Device rejected '{command}': {marker}")]
    DeviceFailure { command: String, marker: String },

    /// The profile has no query for a step the scan needs
    #[error("Profile '{profile}' has no {what}")]
    Unsupported {
        profile: String,
        what: &'static str,
    },

    /// A profile query pattern does not compile
    #[error("Invalid query pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Result type alias using linkwatch's Error.
pub type Result<T> = std::result::Result<T, Error>;
