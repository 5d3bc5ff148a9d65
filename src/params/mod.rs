//! Parameter cache module

mod store;

pub use self::store::ParameterStore;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Store shared between the link session (writer) and callers (readers)
pub type SharedStore = Arc<RwLock<ParameterStore>>;

/// Creates an empty shared store
pub fn shared_store() -> SharedStore {
    Arc::new(RwLock::new(ParameterStore::new()))
}

/// Read lock that survives a panicked writer
pub fn read(store: &SharedStore) -> RwLockReadGuard<'_, ParameterStore> {
    store.read().unwrap_or_else(|e| e.into_inner())
}

/// Write lock that survives a panicked writer
pub fn write(store: &SharedStore) -> RwLockWriteGuard<'_, ParameterStore> {
    store.write().unwrap_or_else(|e| e.into_inner())
}
