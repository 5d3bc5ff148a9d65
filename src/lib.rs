//! mavparam: MAVLink parameter client
//!
//! Talks to a drone flight controller over a serial link, keeps a cache of its
//! parameters and runs get/set/refresh operations with timeouts, retries and
//! verification of every write against the vehicle's echo.
pub mod core;
pub mod engine;
pub mod params;
pub mod protocol;
pub mod session;
pub mod transport;
mod util;

// Re-export commonly used items
pub use crate::core::{
    ConnectionConfig, Error, ErrorKind, ManagerConfig, OperationKind, OperationResult, ParamType,
    ParamValue, ParameterInfo, Result,
};
pub use crate::engine::ParameterManager;
pub use crate::protocol::{ConnectionEvent, LinkState};
pub use crate::session::ALL_PARAMETERS;
pub use crate::transport::{detect_ports, find_best_port, validate_port_config, PortCandidate, PortValidation, SimulatedVehicle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
