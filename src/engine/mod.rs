//! Operation engine module
//!
//! Tracks pending get/set/refresh operations with their deadlines and retries,
//! and exposes the caller-facing `ParameterManager`.

pub mod operation;
mod manager;
mod reconnect;

pub use self::manager::ParameterManager;
pub use self::operation::{OpRequest, PendingOperation};
