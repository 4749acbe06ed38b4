//! Sensor module for BLE cycling power sensors.

pub mod btle;
pub mod cadence;
pub mod decoder;
pub mod manager;
pub mod observer;
pub mod protocol;
pub mod reconnect;
pub mod transport;
pub mod types;

pub use btle::{BtleDevice, BtleTransport};
pub use cadence::{CadenceEstimator, CadenceUpdate, DecoderState};
pub use decoder::{DecodeError, MeasurementDecoder, Reading};
pub use manager::SessionManager;
pub use observer::{PropertyChange, PropertyListener};
pub use protocol::MeasurementKind;
pub use transport::{
    DiscoveryHandler, GattCharacteristic, GattService, NotificationHandler, SensorDevice,
    Transport, TransportEvent,
};
pub use types::{DeviceIdentity, SensorConfig, SensorError, SessionPhase, SessionState};
