//! [`Transport`] implementation on btleplug.

use crate::sensors::transport::{
    DiscoveryHandler, GattCharacteristic, GattService, NotificationHandler, SensorDevice,
    Transport, TransportEvent,
};
use crate::sensors::types::SensorError;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

fn ble_error(e: btleplug::Error) -> SensorError {
    SensorError::Transport(e.to_string())
}

/// A btleplug peripheral with the name it advertised.
#[derive(Debug, Clone)]
pub struct BtleDevice {
    peripheral: Peripheral,
    name: Option<String>,
}

impl BtleDevice {
    async fn from_peripheral(peripheral: Peripheral) -> Self {
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name);
        Self { peripheral, name }
    }
}

impl SensorDevice for BtleDevice {
    fn id(&self) -> String {
        self.peripheral.id().to_string()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }
}

/// (device id, characteristic) -> notification forwarding task
type NotificationTasks = Arc<Mutex<HashMap<(String, Uuid), JoinHandle<()>>>>;

/// Abort and forget every notification task of one device.
fn release_device_tasks(tasks: &NotificationTasks, device_id: &str) -> usize {
    let mut tasks = tasks.lock();
    let keys: Vec<_> = tasks
        .keys()
        .filter(|(id, _)| id == device_id)
        .cloned()
        .collect();
    for key in &keys {
        if let Some(task) = tasks.remove(key) {
            task.abort();
        }
    }
    keys.len()
}

/// BLE transport over the first system adapter.
pub struct BtleTransport {
    adapter: Adapter,
    events_tx: broadcast::Sender<TransportEvent>,
    notification_tasks: NotificationTasks,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    event_pump: JoinHandle<()>,
}

impl BtleTransport {
    /// Initialize the BLE adapter and start forwarding its connection events.
    pub async fn new() -> Result<Self, SensorError> {
        tracing::info!("Initializing BLE transport");

        let manager = Manager::new().await.map_err(ble_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_error)?
            .into_iter()
            .next()
            .ok_or(SensorError::AdapterNotFound)?;

        let (events_tx, _) = broadcast::channel(32);
        let notification_tasks: NotificationTasks = Arc::new(Mutex::new(HashMap::new()));
        let event_pump = tokio::spawn(Self::pump_central_events(
            adapter.clone(),
            events_tx.clone(),
            Arc::clone(&notification_tasks),
        ));

        tracing::info!("BLE adapter initialized");

        Ok(Self {
            adapter,
            events_tx,
            notification_tasks,
            scan_task: Mutex::new(None),
            event_pump,
        })
    }

    async fn pump_central_events(
        adapter: Adapter,
        events_tx: broadcast::Sender<TransportEvent>,
        notification_tasks: NotificationTasks,
    ) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!("Failed to get adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            let forwarded = match event {
                CentralEvent::DeviceConnected(id) => TransportEvent::DeviceConnected(id.to_string()),
                CentralEvent::DeviceDisconnected(peripheral_id) => {
                    let id = peripheral_id.to_string();
                    // A late event for a link that is already back must not kill its tasks
                    let relinked = match adapter.peripheral(&peripheral_id).await {
                        Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
                        Err(_) => false,
                    };
                    let released = if relinked {
                        0
                    } else {
                        release_device_tasks(&notification_tasks, &id)
                    };
                    if released > 0 {
                        tracing::debug!(
                            device_id = %id,
                            "Released {} notification tasks",
                            released
                        );
                    }
                    TransportEvent::DeviceDisconnected(id)
                }
                _ => continue,
            };
            let _ = events_tx.send(forwarded);
        }
    }

    fn find_characteristic(
        device: &BtleDevice,
        characteristic: &GattCharacteristic,
    ) -> Result<Characteristic, SensorError> {
        device
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid
            })
            .ok_or(SensorError::CharacteristicNotFound)
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.event_pump.abort();
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        for (_, task) in self.notification_tasks.lock().drain() {
            task.abort();
        }
    }
}

impl Transport for BtleTransport {
    type Device = BtleDevice;

    async fn is_available(&self) -> bool {
        self.adapter.adapter_info().await.is_ok()
    }

    async fn connect(&self, device: &BtleDevice) -> Result<(), SensorError> {
        device.peripheral.connect().await.map_err(ble_error)
    }

    async fn is_connected(&self, device: &BtleDevice) -> bool {
        device.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self, device: &BtleDevice) -> Result<(), SensorError> {
        device.peripheral.disconnect().await.map_err(ble_error)
    }

    async fn discover_services(&self, device: &BtleDevice) -> Result<Vec<GattService>, SensorError> {
        device
            .peripheral
            .discover_services()
            .await
            .map_err(ble_error)?;

        Ok(device
            .peripheral
            .services()
            .into_iter()
            .map(|s| GattService { uuid: s.uuid })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        device: &BtleDevice,
        service: &GattService,
    ) -> Result<Vec<GattCharacteristic>, SensorError> {
        Ok(device
            .peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service.uuid)
            .flat_map(|s| s.characteristics)
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
            })
            .collect())
    }

    async fn subscribe(
        &self,
        device: &BtleDevice,
        characteristic: &GattCharacteristic,
        on_value: NotificationHandler,
    ) -> Result<(), SensorError> {
        let target = Self::find_characteristic(device, characteristic)?;

        // Open the stream first so the first values are not missed
        let mut notifications = device
            .peripheral
            .notifications()
            .await
            .map_err(|e| SensorError::SubscriptionFailed(e.to_string()))?;

        device
            .peripheral
            .subscribe(&target)
            .await
            .map_err(|e| SensorError::SubscriptionFailed(e.to_string()))?;

        let uuid = characteristic.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid {
                    on_value(&notification.value);
                }
            }
        });

        let previous = self
            .notification_tasks
            .lock()
            .insert((device.id(), uuid), task);
        if let Some(previous) = previous {
            previous.abort();
        }

        Ok(())
    }

    async fn unsubscribe(
        &self,
        device: &BtleDevice,
        characteristic: &GattCharacteristic,
    ) -> Result<(), SensorError> {
        let task = self
            .notification_tasks
            .lock()
            .remove(&(device.id(), characteristic.uuid));
        if let Some(task) = task {
            task.abort();
        }

        let target = Self::find_characteristic(device, characteristic)?;
        device
            .peripheral
            .unsubscribe(&target)
            .await
            .map_err(ble_error)
    }

    async fn scan_for_devices(
        &self,
        services: &[Uuid],
        timeout: Duration,
        on_discovered: DiscoveryHandler<BtleDevice>,
    ) -> Result<(), SensorError> {
        let mut events = self.adapter.events().await.map_err(ble_error)?;

        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(ble_error)?;

        tracing::debug!("Scanning for {:?}", services);

        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            let watch = async {
                while let Some(event) = events.next().await {
                    let id = match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                        _ => continue,
                    };
                    if let Ok(peripheral) = adapter.peripheral(&id).await {
                        on_discovered(BtleDevice::from_peripheral(peripheral).await);
                    }
                }
            };
            let _ = tokio::time::timeout(timeout, watch).await;
        });

        let previous = self.scan_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), SensorError> {
        let task = self.scan_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.adapter.stop_scan().await.map_err(ble_error)
    }

    async fn paired_or_connected_devices(
        &self,
        services: &[Uuid],
    ) -> Result<Vec<BtleDevice>, SensorError> {
        let peripherals = self.adapter.peripherals().await.map_err(ble_error)?;
        let mut devices = Vec::new();

        for peripheral in peripherals {
            let connected = peripheral.is_connected().await.unwrap_or(false);
            let properties = peripheral.properties().await.ok().flatten();
            let advertises = properties
                .as_ref()
                .is_some_and(|p| p.services.iter().any(|s| services.contains(s)));

            if connected || advertises {
                devices.push(BtleDevice {
                    name: properties.and_then(|p| p.local_name),
                    peripheral,
                });
            }
        }

        Ok(devices)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
