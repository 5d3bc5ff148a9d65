//! Byte transport module
//!
//! This module owns the serial byte stream. Transports are polled: reads never
//! block and return whatever bytes have arrived since the last poll.

pub mod discovery;
pub mod serial;
pub mod sim;

pub use self::discovery::{
    detect_ports, find_best_port, test_port, validate_port_config, PortCandidate, PortValidation,
    SUPPORTED_BAUD_RATES,
};
pub use self::serial::{SerialOpener, SerialTransport};
pub use self::sim::{SimOpener, SimTransport, SimulatedVehicle};

use std::io;

use thiserror::Error;

use crate::core::{ConnectionConfig, Error};

/// Faults raised by a transport. They stay inside the link session, which turns
/// them into state transitions and operation failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("port already open: {0}")]
    AlreadyOpen(String),

    #[error("transport closed")]
    Closed,

    #[error("I/O fault: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport calls
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PortNotFound(port) => Error::PortNotFound(port),
            TransportError::PermissionDenied(port) => Error::PermissionDenied(port),
            TransportError::AlreadyOpen(port) => Error::AlreadyOpen(port),
            TransportError::Closed => Error::link_lost("transport closed"),
            TransportError::Io(e) => Error::link_lost(e.to_string()),
        }
    }
}

/// An open byte stream to a vehicle
pub trait Transport: Send {
    /// Returns the bytes available right now, possibly none
    fn read_available(&mut self) -> TransportResult<Vec<u8>>;

    /// Writes a whole frame
    fn write(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Closes the stream; later reads and writes fail with `Closed`
    fn close(&mut self);
}

/// Opens transports for a connection config
pub trait TransportOpener: Send + Sync {
    fn open(&self, config: &ConnectionConfig) -> TransportResult<Box<dyn Transport>>;
}
