//! Core types shared by every layer of the parameter client
//!
//! This module contains the error taxonomy, parameter value types and the
//! configuration structures consumed from outside.

pub mod config;
pub mod error;
pub mod types;
pub mod serde;

pub use self::config::{ConnectionConfig, ManagerConfig, AUTO_PORT};
pub use self::error::{Error, ErrorKind, Result};
pub use self::types::{
    OperationKind,
    OperationResult,
    ParamType,
    ParamValue,
    ParameterInfo,
};

/// Maximum parameter name length in bytes
pub const PARAM_NAME_LEN: usize = 16;

/// Validates a parameter name before it is put on the wire
pub fn validate_param_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_request("parameter name is empty"));
    }
    if !name.is_ascii() {
        return Err(Error::invalid_request(format!("parameter name {:?} is not ASCII", name)));
    }
    if name.bytes().any(|b| b == b'\0') {
        // A NUL would end the name early on the wire
        return Err(Error::invalid_request(format!("parameter name {:?} contains NUL", name)));
    }
    if name.len() > PARAM_NAME_LEN {
        return Err(Error::invalid_request(format!(
            "parameter name {:?} exceeds {} bytes",
            name, PARAM_NAME_LEN
        )));
    }
    Ok(())
}
