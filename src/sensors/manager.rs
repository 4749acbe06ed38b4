//! Sensor session manager: connection lifecycle and live readings.
//!
//! Lifecycle calls (`connect`, `disconnect`, `try_reconnect_last`, transport
//! disconnect events) are serialized through one async mutex. Notification
//! callbacks only touch the readings behind a separate synchronous lock, so decoding
//! never waits on an in-flight lifecycle call.

use crate::sensors::cadence::{CadenceUpdate, DecoderState};
use crate::sensors::decoder::MeasurementDecoder;
use crate::sensors::observer::{Observers, PropertyChange, PropertyListener};
use crate::sensors::protocol::{MeasurementKind, CSC_MEASUREMENT_UUID};
use crate::sensors::transport::{
    GattCharacteristic, GattService, NotificationHandler, SensorDevice, Transport, TransportEvent,
};
use crate::sensors::types::{SensorConfig, SensorError, SessionPhase, SessionState};
use crate::storage::kv::{clear_identity, save_identity, KeyValueStore, DEVICE_IDENTITY_KEY};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Connection resources owned by the lifecycle lock.
pub(super) struct Lifecycle<D> {
    pub(super) device: Option<D>,
    /// Active measurement subscriptions on `device`
    pub(super) subscriptions: Vec<GattCharacteristic>,
}

impl<D> Default for Lifecycle<D> {
    fn default() -> Self {
        Self {
            device: None,
            subscriptions: Vec::new(),
        }
    }
}

struct Readings {
    state: SessionState,
    decoder: MeasurementDecoder,
    /// Bumped on every connect and teardown; stale subscriptions are ignored
    generation: u64,
}

/// State shared with notification callbacks.
pub(super) struct SessionShared {
    readings: Mutex<Readings>,
    /// Held from mutation through delivery so observers see changes in commit order
    delivery: Mutex<()>,
    observers: Observers,
}

impl SessionShared {
    fn new(stale_after: Duration) -> Self {
        Self {
            readings: Mutex::new(Readings {
                state: SessionState::default(),
                decoder: MeasurementDecoder::new(stale_after),
                generation: 0,
            }),
            delivery: Mutex::new(()),
            observers: Observers::new(),
        }
    }

    pub(super) fn snapshot(&self) -> SessionState {
        self.readings.lock().state
    }

    fn decoder_state(&self, kind: MeasurementKind) -> DecoderState {
        *self.readings.lock().decoder.state(kind)
    }

    /// Mutate under the readings lock, then notify observers outside it.
    ///
    /// Listeners run while `delivery` is held and must not call back into the
    /// session's mutating paths.
    fn update<F: FnOnce(&mut Readings)>(&self, f: F) {
        let _delivery = self.delivery.lock();
        let changes = {
            let mut readings = self.readings.lock();
            let before = readings.state;
            f(&mut readings);
            PropertyChange::diff(&before, &readings.state)
        };
        self.observers.notify(&changes);
    }

    pub(super) fn set_phase(&self, phase: SessionPhase) {
        self.update(|r| r.state.phase = phase);
    }

    pub(super) fn set_reconnecting(&self, reconnecting: bool) {
        self.update(|r| {
            r.state.is_reconnecting = reconnecting;
            if reconnecting {
                r.state.phase = SessionPhase::Reconnecting;
            } else if r.state.phase == SessionPhase::Reconnecting {
                r.state.phase = SessionPhase::Idle;
            }
        });
    }

    /// Reset readings for a new attempt and return its generation.
    fn begin_connection(&self) -> u64 {
        let mut generation = 0;
        self.update(|r| {
            r.generation += 1;
            generation = r.generation;
            r.decoder.reset();
            r.state.clear_readings();
            r.state.phase = SessionPhase::Connecting;
        });
        generation
    }

    fn mark_subscribed(&self) {
        self.update(|r| {
            r.state.phase = SessionPhase::Subscribed;
            r.state.is_connected = true;
        });
    }

    /// Drop the live connection's readings; late notifications are ignored.
    fn end_connection(&self) {
        self.update(|r| {
            r.generation += 1;
            r.decoder.reset();
            r.state.clear_readings();
            r.state.phase = SessionPhase::Idle;
        });
    }

    fn handle_notification(
        &self,
        generation: u64,
        kind: MeasurementKind,
        data: &[u8],
        now: Instant,
    ) {
        self.update(|r| {
            if r.generation != generation {
                return;
            }
            match r.decoder.decode(kind, data, now) {
                Ok(reading) => {
                    if let Some(power) = reading.power_watts {
                        r.state.power = i32::from(power);
                    }
                    match reading.cadence {
                        CadenceUpdate::Computed(rpm) => r.state.cadence = rpm,
                        CadenceUpdate::Stale => r.state.cadence = 0,
                        CadenceUpdate::Seeded | CadenceUpdate::Hold => {}
                    }
                }
                Err(e) => {
                    tracing::debug!(len = data.len(), "Dropping {} measurement: {}", kind, e);
                }
            }
        });
    }
}

/// Measurement services present on the device, Cycling Power first.
fn measurement_services(services: &[GattService]) -> Vec<(&GattService, MeasurementKind)> {
    [MeasurementKind::CyclingPower, MeasurementKind::SpeedCadence]
        .into_iter()
        .filter_map(|kind| {
            services
                .iter()
                .find(|s| s.uuid == kind.service_uuid())
                .map(|s| (s, kind))
        })
        .collect()
}

/// Owns one sensor connection and its observable readings.
pub struct SessionManager<T: Transport, S: KeyValueStore> {
    pub(super) transport: Arc<T>,
    pub(super) store: Arc<S>,
    pub(super) config: SensorConfig,
    pub(super) lifecycle: tokio::sync::Mutex<Lifecycle<T::Device>>,
    pub(super) shared: Arc<SessionShared>,
    pub(super) auto_reconnect_active: AtomicBool,
}

impl<T: Transport, S: KeyValueStore> SessionManager<T, S> {
    /// Create a session over the given transport and store.
    pub fn new(transport: Arc<T>, store: Arc<S>, config: SensorConfig) -> Self {
        let shared = Arc::new(SessionShared::new(config.cadence_stale_after));
        Self {
            transport,
            store,
            config,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            shared,
            auto_reconnect_active: AtomicBool::new(false),
        }
    }

    /// Snapshot of the observable state.
    pub fn state(&self) -> SessionState {
        self.shared.snapshot()
    }

    pub fn power(&self) -> i32 {
        self.state().power
    }

    pub fn cadence(&self) -> u32 {
        self.state().cadence
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state().is_reconnecting
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    /// Crank counters of the current connection for one measurement source.
    pub fn decoder_state(&self, kind: MeasurementKind) -> DecoderState {
        self.shared.decoder_state(kind)
    }

    /// Register a callback for every property change.
    pub fn add_listener(&self, listener: PropertyListener) {
        self.shared.observers.add_listener(listener);
    }

    /// Receive property changes over a broadcast channel.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PropertyChange> {
        self.shared.observers.subscribe()
    }

    /// Whether a last-device identity is persisted.
    pub fn has_stored_identity(&self) -> bool {
        match self.store.contains(DEVICE_IDENTITY_KEY) {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!("Failed to read device identity: {}", e);
                false
            }
        }
    }

    /// Device of the live connection, if any.
    pub async fn connected_device(&self) -> Option<T::Device> {
        self.lifecycle.lock().await.device.clone()
    }

    /// Connect to a device and start streaming its measurements.
    ///
    /// The device identity is persisted before the transport connect starts. Any
    /// failure tears the attempt down and is returned as
    /// [`SensorError::ConnectionFailed`].
    pub async fn connect(&self, device: T::Device) -> Result<(), SensorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.connect_locked(&mut lifecycle, device).await
    }

    pub(super) async fn connect_locked(
        &self,
        lifecycle: &mut Lifecycle<T::Device>,
        device: T::Device,
    ) -> Result<(), SensorError> {
        let identity = device.identity();
        tracing::info!(device_id = %identity.id, "Connecting to sensor: {}", identity);

        if lifecycle.device.is_some() {
            self.teardown_locked(lifecycle).await;
        }

        if let Err(e) = save_identity(self.store.as_ref(), &identity) {
            tracing::warn!("Failed to persist device identity: {}", e);
        }

        let generation = self.shared.begin_connection();
        lifecycle.device = Some(device.clone());

        match self.establish(lifecycle, &device, generation).await {
            Ok(kinds) => {
                self.shared.mark_subscribed();
                let sources: Vec<String> = kinds.iter().map(ToString::to_string).collect();
                tracing::info!(
                    device_id = %identity.id,
                    "Streaming {} measurements",
                    sources.join(" + ")
                );
                Ok(())
            }
            Err(cause) => {
                tracing::warn!(device_id = %identity.id, "Connection failed: {}", cause);
                self.teardown_locked(lifecycle).await;
                self.shared.set_phase(SessionPhase::Failed);
                Err(SensorError::connection_failed(cause))
            }
        }
    }

    /// Connect, discover and subscribe.
    async fn establish(
        &self,
        lifecycle: &mut Lifecycle<T::Device>,
        device: &T::Device,
        generation: u64,
    ) -> Result<Vec<MeasurementKind>, SensorError> {
        tokio::time::timeout(self.config.connection_timeout, self.transport.connect(device))
            .await
            .map_err(|_| SensorError::ConnectionTimeout)??;

        self.shared.set_phase(SessionPhase::Discovering);

        let services = self.transport.discover_services(device).await?;
        let measurements = self.locate_measurements(device, &services).await?;

        let mut kinds = Vec::with_capacity(measurements.len());
        for (characteristic, kind) in measurements {
            let shared = Arc::clone(&self.shared);
            let on_value: NotificationHandler = Arc::new(move |data: &[u8]| {
                shared.handle_notification(generation, kind, data, Instant::now());
            });

            self.transport
                .subscribe(device, &characteristic, on_value)
                .await?;
            tracing::debug!("Subscribed to characteristic: {}", characteristic.uuid);
            lifecycle.subscriptions.push(characteristic);
            kinds.push(kind);
        }

        Ok(kinds)
    }

    /// Find the measurement characteristics to subscribe.
    ///
    /// The first service found must carry its measurement characteristic. A CSC
    /// Measurement next to Cycling Power, in the same service or in its own, is
    /// added as a cadence source.
    async fn locate_measurements(
        &self,
        device: &T::Device,
        services: &[GattService],
    ) -> Result<Vec<(GattCharacteristic, MeasurementKind)>, SensorError> {
        let sources = measurement_services(services);
        if sources.is_empty() {
            return Err(SensorError::ServiceNotFound);
        }

        let mut found: Vec<(GattCharacteristic, MeasurementKind)> = Vec::new();
        for (index, (service, kind)) in sources.into_iter().enumerate() {
            if found.iter().any(|(_, k)| *k == kind) {
                continue;
            }

            let characteristics = self
                .transport
                .discover_characteristics(device, service)
                .await?;

            match characteristics
                .iter()
                .find(|c| c.uuid == kind.characteristic_uuid())
            {
                Some(characteristic) => found.push((characteristic.clone(), kind)),
                None if index == 0 => return Err(SensorError::CharacteristicNotFound),
                None => {
                    tracing::debug!("{} service has no measurement characteristic", kind);
                    continue;
                }
            }

            if kind == MeasurementKind::CyclingPower {
                if let Some(csc) = characteristics
                    .iter()
                    .find(|c| c.uuid == CSC_MEASUREMENT_UUID)
                {
                    found.push((csc.clone(), MeasurementKind::SpeedCadence));
                }
            }
        }

        Ok(found)
    }

    /// Release subscriptions and connection, best-effort, and zero the readings.
    ///
    /// Leaves the persisted identity alone.
    pub(super) async fn teardown_locked(&self, lifecycle: &mut Lifecycle<T::Device>) {
        self.shared.end_connection();

        let subscriptions = std::mem::take(&mut lifecycle.subscriptions);
        if let Some(device) = lifecycle.device.as_ref() {
            for characteristic in subscriptions {
                if let Err(e) = self.transport.unsubscribe(device, &characteristic).await {
                    tracing::warn!("Failed to unsubscribe {}: {}", characteristic.uuid, e);
                }
            }
        }

        if let Some(device) = lifecycle.device.take() {
            if let Err(e) = self.transport.disconnect(&device).await {
                tracing::warn!(device_id = %device.id(), "Transport disconnect failed: {}", e);
            }
        }
    }

    /// User-initiated disconnect. Forgets the persisted device.
    ///
    /// Safe to call when already disconnected. Transport faults are logged; only a
    /// failure to clear the stored identity is returned.
    pub async fn disconnect(&self) -> Result<(), SensorError> {
        let mut lifecycle = self.lifecycle.lock().await;

        if let Some(device) = lifecycle.device.as_ref() {
            tracing::info!(device_id = %device.id(), "Disconnecting from sensor");
            self.shared.set_phase(SessionPhase::Disconnecting);
        }
        self.teardown_locked(&mut lifecycle).await;

        clear_identity(self.store.as_ref())?;
        Ok(())
    }

    /// Tear down the live connection but keep the identity for the next start.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down sensor session");
        let mut lifecycle = self.lifecycle.lock().await;
        self.teardown_locked(&mut lifecycle).await;
    }

    /// Apply a transport event. Returns true when it ended the live connection.
    pub async fn handle_transport_event(&self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::DeviceDisconnected(id) => self.handle_unsolicited_disconnect(&id).await,
            TransportEvent::DeviceConnected(id) => {
                tracing::debug!(device_id = %id, "Transport reported connection");
                false
            }
        }
    }

    async fn handle_unsolicited_disconnect(&self, id: &str) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;

        let Some(device) = lifecycle
            .device
            .clone()
            .filter(|device| device.id() == id)
        else {
            return false;
        };

        // Our own teardowns raise the same event; a re-established link stays up.
        if self.transport.is_connected(&device).await {
            tracing::debug!(device_id = %id, "Ignoring disconnect event for a live link");
            return false;
        }

        tracing::warn!(device_id = %id, "Sensor disconnected unexpectedly");
        self.shared.end_connection();

        for characteristic in std::mem::take(&mut lifecycle.subscriptions) {
            if let Err(e) = self.transport.unsubscribe(&device, &characteristic).await {
                tracing::debug!("Releasing {} after link loss: {}", characteristic.uuid, e);
            }
        }
        lifecycle.device = None;
        true
    }

    /// Forward transport events to the session until the transport goes away.
    ///
    /// With `auto_reconnect` enabled, an unsolicited disconnect starts
    /// [`SessionManager::run_auto_reconnect`].
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let mut events = self.transport.events();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let dropped = session.handle_transport_event(event).await;
                        if dropped && session.config.auto_reconnect {
                            tokio::spawn(Arc::clone(&session).run_auto_reconnect());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} transport events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Transport event stream closed");
        })
    }
}
