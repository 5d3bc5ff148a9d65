use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::core::{ParamType, ParamValue, ParameterInfo};

/// In-memory cache of the vehicle's parameters
///
/// Entries are only created from values the vehicle reported. The link
/// session is the single writer; everyone else reads copies.
#[derive(Debug, Default)]
pub struct ParameterStore {
    params: HashMap<String, ParameterInfo>,
    /// Total count from the most recent value packet
    total_count: Option<u16>,
    /// Names received since the last refresh started
    received: HashSet<String>,
    /// Known rounding steps, used as float verification tolerance
    increments: HashMap<String, f32>,
}

impl ParameterStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an authoritative value; the last arrival wins
    pub fn upsert(&mut self, name: &str, value: ParamValue, param_type: ParamType, index: u16, count: u16) {
        let info = ParameterInfo {
            name: name.to_string(),
            value,
            param_type,
            index,
            count,
            updated_at: Utc::now(),
        };
        self.params.insert(name.to_string(), info);
        self.received.insert(name.to_string());
        self.total_count = Some(count);
    }

    /// Copy of one entry
    pub fn get(&self, name: &str) -> Option<ParameterInfo> {
        self.params.get(name).cloned()
    }

    /// Copy of every entry
    pub fn all(&self) -> HashMap<String, ParameterInfo> {
        self.params.clone()
    }

    /// Declared type of a cached parameter
    pub fn param_type(&self, name: &str) -> Option<ParamType> {
        self.params.get(name).map(|p| p.param_type)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Most recently reported total parameter count
    pub fn total_count(&self) -> Option<u16> {
        self.total_count
    }

    /// Starts counting distinct names for a new refresh
    pub fn begin_refresh(&mut self) {
        self.received.clear();
    }

    /// Distinct names received since the last `begin_refresh`
    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// True once the distinct names received match the vehicle's total count
    pub fn is_refresh_complete(&self) -> bool {
        match self.total_count {
            Some(total) => self.received.len() >= total as usize,
            None => false,
        }
    }

    /// Declares the rounding step of a float parameter
    pub fn set_increment(&mut self, name: &str, increment: f32) {
        self.increments.insert(name.to_string(), increment);
    }

    pub fn increment(&self, name: &str) -> Option<f32> {
        self.increments.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_overwrites() {
        let mut store = ParameterStore::new();
        store.upsert("MPC_XY_VEL_MAX", ParamValue::Float(12.0), ParamType::Real32, 2, 10);
        store.upsert("MPC_XY_VEL_MAX", ParamValue::Float(8.0), ParamType::Real32, 2, 10);

        let info = store.get("MPC_XY_VEL_MAX").unwrap();
        assert_eq!(info.value, ParamValue::Float(8.0));
        assert_eq!(store.len(), 1);
        assert!(store.get("mpc_xy_vel_max").is_none());
    }

    #[test]
    fn test_refresh_completion() {
        let mut store = ParameterStore::new();
        assert!(!store.is_refresh_complete());

        store.begin_refresh();
        store.upsert("A", ParamValue::Int(1), ParamType::Int32, 0, 3);
        store.upsert("B", ParamValue::Int(2), ParamType::Int32, 1, 3);
        // Duplicates do not count twice
        store.upsert("B", ParamValue::Int(2), ParamType::Int32, 1, 3);
        assert!(!store.is_refresh_complete());

        store.upsert("C", ParamValue::Int(3), ParamType::Int32, 2, 3);
        assert!(store.is_refresh_complete());

        // A new refresh starts counting again but keeps the cache
        store.begin_refresh();
        assert!(!store.is_refresh_complete());
        assert_eq!(store.all().len(), 3);
    }

    #[test]
    fn test_latest_count_is_trusted() {
        let mut store = ParameterStore::new();
        store.upsert("A", ParamValue::Int(1), ParamType::Int32, 0, 5);
        store.upsert("B", ParamValue::Int(1), ParamType::Int32, 1, 2);
        assert_eq!(store.total_count(), Some(2));
        assert!(store.is_refresh_complete());
    }
}
