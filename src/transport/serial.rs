//! Serial transport implementation

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info};

use super::discovery::find_best_port;
use super::{Transport, TransportError, TransportOpener, TransportResult};
use crate::core::ConnectionConfig;

/// Port timeout applied after open; reads are only issued for bytes already
/// queued. Writes retry through it until the configured timeout.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Devices currently held by this process
fn held_ports() -> &'static Mutex<HashSet<String>> {
    static HELD: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Releases the device name when the transport goes away
struct PortClaim {
    name: String,
}

impl PortClaim {
    fn acquire(name: &str) -> TransportResult<Self> {
        let mut held = held_ports().lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(name.to_string()) {
            return Err(TransportError::AlreadyOpen(name.to_string()));
        }
        Ok(PortClaim { name: name.to_string() })
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        let mut held = held_ports().lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.name);
    }
}

/// Serial transport for a flight controller's USB or UART port
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    claim: Option<PortClaim>,
    write_timeout: Duration,
}

impl SerialTransport {
    /// Opens a serial port at 8N1 without flow control
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> TransportResult<Self> {
        let claim = PortClaim::acquire(path)?;

        let mut port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| map_open_error(path, e))?;
        port.set_timeout(READ_TIMEOUT).map_err(io::Error::from)?;

        info!(port = %path, baud_rate, "Opened serial port");

        Ok(SerialTransport { port: Some(port), claim: Some(claim), write_timeout: timeout })
    }

    fn port(&mut self) -> TransportResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self) -> TransportResult<Vec<u8>> {
        let port = self.port()?;
        let queued = port.bytes_to_read().map_err(io::Error::from)? as usize;
        if queued == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; queued];
        match port.read(&mut buffer) {
            Ok(n) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        let timeout = self.write_timeout;
        let port = self.port()?;
        write_all_within(&mut **port, data, timeout)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            if let Some(claim) = self.claim.take() {
                debug!(port = %claim.name, "Closed serial port");
            }
        }
    }
}

/// Writes and flushes all of `data`, retrying timed-out calls until `timeout`
/// has passed
fn write_all_within<W: Write + ?Sized>(writer: &mut W, mut data: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "serial port accepted no bytes")),
            Ok(n) => data = &data[n..],
            Err(e) if is_transient(&e) && Instant::now() < deadline => {}
            Err(e) => return Err(e),
        }
    }
    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) && Instant::now() < deadline => {}
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn map_open_error(path: &str, err: serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => TransportError::PortNotFound(path.to_string()),
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
            TransportError::PortNotFound(path.to_string())
        }
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            TransportError::PermissionDenied(path.to_string())
        }
        _ => TransportError::Io(err.into()),
    }
}

/// Opens real serial ports, resolving "auto" through port discovery
#[derive(Debug, Clone, Default)]
pub struct SerialOpener;

impl SerialOpener {
    pub fn new() -> Self {
        SerialOpener
    }
}

impl TransportOpener for SerialOpener {
    fn open(&self, config: &ConnectionConfig) -> TransportResult<Box<dyn Transport>> {
        let path = if config.is_auto() {
            find_best_port().ok_or_else(|| TransportError::PortNotFound(config.port.clone()))?
        } else {
            config.port.clone()
        };

        let transport = SerialTransport::open(&path, config.baud_rate, config.timeout)?;
        Ok(Box::new(transport))
    }
}
