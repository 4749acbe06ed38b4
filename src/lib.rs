//! CPSense - BLE cycling power session manager
//!
//! Connects to a Bluetooth LE cycling power meter, decodes its measurement
//! notifications into live power and cadence, remembers the last sensor and
//! reattaches to it after restarts or dropped links.

pub mod sensors;
pub mod storage;

// Re-export commonly used types
pub use sensors::manager::SessionManager;
pub use sensors::types::{DeviceIdentity, SensorConfig, SensorError, SessionState};
pub use storage::config::AppConfig;
pub use storage::database::Database;
