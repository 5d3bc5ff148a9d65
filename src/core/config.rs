use std::time::Duration;

use serde::{Serialize, Deserialize};

use super::error::{Error, Result};
use crate::protocol::{DEFAULT_COMPONENT_ID, DEFAULT_SYSTEM_ID};

/// Port value that asks the client to pick a port by itself
pub const AUTO_PORT: &str = "auto";

/// Configuration of one serial link session. Immutable once a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Device path, or "auto" for discovery
    pub port: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Serial open / write timeout
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub timeout: Duration,
    /// Connect attempts before giving up
    pub retries: u32,
    /// Maximum silence before the link counts as degraded
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub heartbeat_timeout: Duration,
    /// Additional silence after degradation before the link counts as lost
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub link_loss_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            port: AUTO_PORT.to_string(),
            baud_rate: 115_200,
            timeout: Duration::from_secs(5),
            retries: 3,
            heartbeat_timeout: Duration::from_secs(10),
            link_loss_grace: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Creates a config for a specific port and baud rate
    pub fn for_port(port: impl Into<String>, baud_rate: u32) -> Self {
        ConnectionConfig {
            port: port.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Whether the port should be discovered rather than opened by name
    pub fn is_auto(&self) -> bool {
        self.port.is_empty() || self.port.eq_ignore_ascii_case(AUTO_PORT)
    }

    /// Rejects non-positive timeouts and retry counts
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(Error::config("baud rate must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(Error::config("connection timeout must be positive"));
        }
        if self.retries == 0 {
            return Err(Error::config("connection retries must be at least 1"));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(Error::config("heartbeat timeout must be positive"));
        }
        if self.link_loss_grace.is_zero() {
            return Err(Error::config("link loss grace must be positive"));
        }
        Ok(())
    }
}

/// Configuration of the parameter manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Link settings used by connect()
    pub connection: ConnectionConfig,
    /// Per-attempt timeout for get/set when the caller gives none
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub operation_timeout: Duration,
    /// Total wire attempts for a get/set
    pub retry_attempts: u32,
    /// Fixed pause between get/set attempts
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub retry_delay: Duration,
    /// Poll period of the pump loop
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub message_processing_interval: Duration,
    /// Reconnect automatically after link loss
    pub auto_reconnect: bool,
    /// Reconnect attempts per loss episode
    pub max_reconnect_attempts: u32,
    /// Load the full parameter table after connecting
    pub refresh_on_connect: bool,
    /// Timeout of the refresh issued after connecting
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub connect_refresh_timeout: Duration,
    /// Answer get_parameter from the cache when the name is known
    pub serve_cached_reads: bool,
    /// Send our own GCS heartbeat at this period
    #[serde(serialize_with = "super::serde::serialize_opt_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_opt_duration")]
    pub gcs_heartbeat_interval: Option<Duration>,
    /// Our MAVLink system id
    pub system_id: u8,
    /// Our MAVLink component id
    pub component_id: u8,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            connection: ConnectionConfig::default(),
            operation_timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            message_processing_interval: Duration::from_millis(100),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            refresh_on_connect: true,
            connect_refresh_timeout: Duration::from_secs(15),
            serve_cached_reads: false,
            gcs_heartbeat_interval: None,
            system_id: DEFAULT_SYSTEM_ID,
            component_id: DEFAULT_COMPONENT_ID,
        }
    }
}

impl ManagerConfig {
    /// Validates this config and the embedded connection config
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;

        if self.operation_timeout.is_zero() {
            return Err(Error::config("operation timeout must be positive"));
        }
        if self.retry_attempts == 0 {
            return Err(Error::config("retry attempts must be at least 1"));
        }
        if self.message_processing_interval.is_zero() {
            return Err(Error::config("message processing interval must be positive"));
        }
        if self.auto_reconnect && self.max_reconnect_attempts == 0 {
            return Err(Error::config("max reconnect attempts must be at least 1"));
        }
        if self.refresh_on_connect && self.connect_refresh_timeout.is_zero() {
            return Err(Error::config("connect refresh timeout must be positive"));
        }
        if matches!(self.gcs_heartbeat_interval, Some(d) if d.is_zero()) {
            return Err(Error::config("GCS heartbeat interval must be positive"));
        }
        Ok(())
    }
}
