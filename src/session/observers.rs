use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::core::{OperationResult, ParameterInfo};
use crate::protocol::ConnectionEvent;

/// Name that subscribes a parameter callback to every parameter
pub const ALL_PARAMETERS: &str = "*";

pub type OperationCallback = Arc<dyn Fn(&OperationResult) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;
pub type ParameterCallback = Arc<dyn Fn(&ParameterInfo) + Send + Sync>;

/// Registered observers, shared by the manager and every session it creates.
///
/// Callbacks run on the pump task and must not block. A panicking callback is
/// logged and skipped.
#[derive(Default)]
pub struct Observers {
    operation: RwLock<Vec<OperationCallback>>,
    connection: RwLock<Vec<ConnectionCallback>>,
    parameter: RwLock<Vec<(String, ParameterCallback)>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_operation(&self, callback: OperationCallback) {
        self.operation.write().unwrap_or_else(|e| e.into_inner()).push(callback);
    }

    pub fn add_connection(&self, callback: ConnectionCallback) {
        self.connection.write().unwrap_or_else(|e| e.into_inner()).push(callback);
    }

    /// Subscribes to one parameter, or to all of them with `"*"`
    pub fn add_parameter(&self, name: &str, callback: ParameterCallback) {
        self.parameter
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), callback));
    }

    pub fn notify_operation(&self, result: &OperationResult) {
        let callbacks = self.operation.read().unwrap_or_else(|e| e.into_inner()).clone();
        for callback in callbacks {
            guarded("operation", || callback(result));
        }
    }

    pub fn notify_connection(&self, event: &ConnectionEvent) {
        let callbacks = self.connection.read().unwrap_or_else(|e| e.into_inner()).clone();
        for callback in callbacks {
            guarded("connection", || callback(event));
        }
    }

    pub fn notify_parameter(&self, info: &ParameterInfo) {
        let callbacks: Vec<ParameterCallback> = self
            .parameter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(name, _)| name == ALL_PARAMETERS || *name == info.name)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            guarded("parameter", || callback(info));
        }
    }
}

fn guarded<F: FnOnce()>(kind: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(observer = kind, "Observer callback panicked");
    }
}
