//! Session types, configuration and errors for the cycling power sensor.

use crate::storage::config::SensorSettings;
use crate::storage::kv::StorageError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Identity of the last connected sensor, persisted for reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Stable transport identifier (address or platform UUID)
    pub id: String,
    /// Advertised name, if any
    pub name: Option<String>,
    /// Whether the device advertised itself as connectable
    pub is_connectable: bool,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, name: Option<String>, is_connectable: bool) -> Self {
        Self {
            id: id.into(),
            name,
            is_connectable,
        }
    }

    /// Serialize to the stored JSON record.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the stored JSON record.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Lifecycle phase of the sensor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No connection
    #[default]
    Idle,
    /// Transport connect in progress
    Connecting,
    /// Service/characteristic discovery in progress
    Discovering,
    /// Streaming measurement notifications
    Subscribed,
    /// User-initiated teardown in progress
    Disconnecting,
    /// Looking for the last known device
    Reconnecting,
    /// Last connect attempt failed
    Failed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "Idle"),
            SessionPhase::Connecting => write!(f, "Connecting..."),
            SessionPhase::Discovering => write!(f, "Discovering..."),
            SessionPhase::Subscribed => write!(f, "Subscribed"),
            SessionPhase::Disconnecting => write!(f, "Disconnecting..."),
            SessionPhase::Reconnecting => write!(f, "Reconnecting..."),
            SessionPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Instantaneous power in watts
    pub power: i32,
    /// Cadence in RPM
    pub cadence: u32,
    pub is_connected: bool,
    pub is_reconnecting: bool,
}

impl SessionState {
    /// Zero the live readings and drop the connected flag.
    pub fn clear_readings(&mut self) {
        self.power = 0;
        self.cadence = 0;
        self.is_connected = false;
    }
}

/// Runtime configuration for the session and reconnect coordinator.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Timeout for the transport connect step
    pub connection_timeout: Duration,
    /// Bound on the reconnect scan fallback
    pub reconnect_scan_timeout: Duration,
    /// Silence window after which cadence is zeroed
    pub cadence_stale_after: Duration,
    /// Whether an unsolicited disconnect starts the auto-reconnect loop
    pub auto_reconnect: bool,
    /// Delay before the first auto-reconnect attempt
    pub reconnect_initial_delay: Duration,
    /// Delay between auto-reconnect attempts
    pub reconnect_retry_interval: Duration,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            reconnect_scan_timeout: Duration::from_secs(5),
            cadence_stale_after: Duration::from_secs(3),
            auto_reconnect: true,
            reconnect_initial_delay: Duration::from_secs(2),
            reconnect_retry_interval: Duration::from_secs(5),
        }
    }
}

impl From<&SensorSettings> for SensorConfig {
    fn from(settings: &SensorSettings) -> Self {
        Self {
            connection_timeout: Duration::from_secs(u64::from(settings.connection_timeout_secs)),
            reconnect_scan_timeout: Duration::from_millis(settings.reconnect_scan_timeout_ms),
            cadence_stale_after: Duration::from_millis(settings.cadence_stale_after_ms),
            auto_reconnect: settings.auto_reconnect,
            reconnect_initial_delay: Duration::from_millis(settings.reconnect_initial_delay_ms),
            reconnect_retry_interval: Duration::from_millis(settings.reconnect_retry_interval_ms),
        }
    }
}

/// Errors that can occur in the sensor session.
#[derive(Debug, Error)]
pub enum SensorError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Transport-level failure
    #[error("BLE error: {0}")]
    Transport(String),

    /// Neither the Cycling Power nor the CSC service was discovered
    #[error("Cycling Power service not found")]
    ServiceNotFound,

    /// The measurement characteristic is missing from the service
    #[error("Measurement characteristic not found")]
    CharacteristicNotFound,

    /// Failed to subscribe to measurement notifications
    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    /// Transport connect did not complete in time
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// Connect sequence failed; wraps the step that failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<SensorError>),

    /// Scan fallback ran out of time
    #[error("Reconnect scan timed out")]
    ReconnectTimeout,

    /// Scan ended without seeing the stored device
    #[error("Last known device not found")]
    ReconnectNotFound,

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SensorError {
    /// Wrap a connect-step failure.
    pub fn connection_failed(cause: SensorError) -> Self {
        match cause {
            SensorError::ConnectionFailed(_) => cause,
            other => SensorError::ConnectionFailed(Box::new(other)),
        }
    }

    /// Underlying cause of a wrapped connect failure, or `self`.
    pub fn root_cause(&self) -> &SensorError {
        match self {
            SensorError::ConnectionFailed(inner) => inner.root_cause(),
            other => other,
        }
    }
}
