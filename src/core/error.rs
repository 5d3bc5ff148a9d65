use std::io;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Custom error types for the parameter client
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Port already open: {0}")]
    AlreadyOpen(String),

    #[error("No heartbeat within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Link lost: {0}")]
    LinkLost(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-visible failure taxonomy carried inside operation results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PortNotFound,
    PermissionDenied,
    ConnectTimeout,
    LinkLost,
    OperationTimeout,
    VerificationFailed,
    Cancelled,
    InvalidConfig,
    NotConnected,
    InvalidRequest,
}

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Creates a new invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    /// Creates a new link lost error
    pub fn link_lost(msg: impl Into<String>) -> Self {
        Error::LinkLost(msg.into())
    }

    /// Maps this error onto the caller-visible taxonomy.
    ///
    /// Raw transport faults (`Io`, `Protocol`) surface as `LinkLost`; an
    /// already-held port is reported like a permission problem. Timeouts and
    /// verification failures only ever happen on the wire, so they exist as
    /// kinds in operation results and never as errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PortNotFound(_) => ErrorKind::PortNotFound,
            Error::PermissionDenied(_) | Error::AlreadyOpen(_) => ErrorKind::PermissionDenied,
            Error::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            Error::LinkLost(_) | Error::Io(_) | Error::Protocol(_) => ErrorKind::LinkLost,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::PortNotFound => "port not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::ConnectTimeout => "connect timeout",
            ErrorKind::LinkLost => "link lost",
            ErrorKind::OperationTimeout => "operation timeout",
            ErrorKind::VerificationFailed => "verification failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidConfig => "invalid config",
            ErrorKind::NotConnected => "not connected",
            ErrorKind::InvalidRequest => "invalid request",
        };
        f.write_str(name)
    }
}
