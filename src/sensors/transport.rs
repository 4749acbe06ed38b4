//! Transport capability consumed by the sensor session.
//!
//! The session never touches a BLE stack directly; it drives an implementation of
//! [`Transport`] (btleplug in production, a scripted mock in tests).

use crate::sensors::types::{DeviceIdentity, SensorError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A device handle produced by a transport.
pub trait SensorDevice: Clone + Send + Sync + 'static {
    /// Stable identifier used for reconnect matching.
    fn id(&self) -> String;

    /// Advertised name.
    fn name(&self) -> Option<String>;

    fn is_connectable(&self) -> bool {
        true
    }

    /// Identity record persisted when connecting to this device.
    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.id(), self.name(), self.is_connectable())
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
}

/// Connection events raised by the transport on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DeviceConnected(String),
    DeviceDisconnected(String),
}

/// Sink for characteristic value notifications.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Sink for devices seen while scanning.
pub type DiscoveryHandler<D> = Arc<dyn Fn(D) + Send + Sync>;

/// Narrow BLE capability used by the session and reconnect coordinator.
pub trait Transport: Send + Sync + 'static {
    type Device: SensorDevice;

    /// Whether the adapter is present and powered.
    fn is_available(&self) -> impl std::future::Future<Output = bool> + Send;

    /// Open a connection to the device.
    fn connect(
        &self,
        device: &Self::Device,
    ) -> impl std::future::Future<Output = Result<(), SensorError>> + Send;

    /// Whether the transport currently holds a link to the device.
    fn is_connected(&self, device: &Self::Device) -> impl std::future::Future<Output = bool> + Send;

    /// Release the connection to the device.
    fn disconnect(
        &self,
        device: &Self::Device,
    ) -> impl std::future::Future<Output = Result<(), SensorError>> + Send;

    /// Discover the device's GATT services.
    fn discover_services(
        &self,
        device: &Self::Device,
    ) -> impl std::future::Future<Output = Result<Vec<GattService>, SensorError>> + Send;

    /// List the characteristics of a discovered service.
    fn discover_characteristics(
        &self,
        device: &Self::Device,
        service: &GattService,
    ) -> impl std::future::Future<Output = Result<Vec<GattCharacteristic>, SensorError>> + Send;

    /// Enable notifications and route values to `on_value`.
    fn subscribe(
        &self,
        device: &Self::Device,
        characteristic: &GattCharacteristic,
        on_value: NotificationHandler,
    ) -> impl std::future::Future<Output = Result<(), SensorError>> + Send;

    /// Disable notifications and drop the registered handler.
    fn unsubscribe(
        &self,
        device: &Self::Device,
        characteristic: &GattCharacteristic,
    ) -> impl std::future::Future<Output = Result<(), SensorError>> + Send;

    /// Start scanning for devices advertising any of `services`.
    ///
    /// Returns once the scan is running; devices are delivered to `on_discovered`
    /// until [`Transport::stop_scanning`] is called or `timeout` elapses.
    fn scan_for_devices(
        &self,
        services: &[Uuid],
        timeout: Duration,
        on_discovered: DiscoveryHandler<Self::Device>,
    ) -> impl std::future::Future<Output = Result<(), SensorError>> + Send;

    fn stop_scanning(&self) -> impl std::future::Future<Output = Result<(), SensorError>> + Send;

    /// Devices already paired or connected that expose any of `services`.
    fn paired_or_connected_devices(
        &self,
        services: &[Uuid],
    ) -> impl std::future::Future<Output = Result<Vec<Self::Device>, SensorError>> + Send;

    /// Subscribe to unsolicited connect/disconnect events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
