//! Reattaching to the last known sensor.
//!
//! Lookup order: devices the platform already knows as paired or connected, then a
//! bounded active scan. Every failure reduces to `false`.

use crate::sensors::manager::{SessionManager, SessionShared};
use crate::sensors::protocol::SUPPORTED_SERVICES;
use crate::sensors::transport::{DiscoveryHandler, SensorDevice, Transport};
use crate::sensors::types::{DeviceIdentity, SensorError};
use crate::storage::kv::{load_identity, KeyValueStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Raises `is_reconnecting` for its lifetime.
struct ReconnectingFlag<'a> {
    shared: &'a SessionShared,
}

impl<'a> ReconnectingFlag<'a> {
    fn raise(shared: &'a SessionShared) -> Self {
        shared.set_reconnecting(true);
        Self { shared }
    }
}

impl Drop for ReconnectingFlag<'_> {
    fn drop(&mut self) {
        self.shared.set_reconnecting(false);
    }
}

/// Stops an active scan when finished or dropped mid-attempt.
struct ScanGuard<T: Transport> {
    transport: Option<Arc<T>>,
}

impl<T: Transport> ScanGuard<T> {
    fn new(transport: Arc<T>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    async fn stop(mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.stop_scanning().await {
                tracing::debug!("Ignoring stop_scanning failure: {}", e);
            }
        }
    }
}

impl<T: Transport> Drop for ScanGuard<T> {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        // Cancelled before `stop`; finish on the runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = transport.stop_scanning().await;
            });
        }
    }
}

/// Marks the auto-reconnect loop as running.
struct LoopGuard<'a> {
    active: &'a AtomicBool,
}

impl<'a> LoopGuard<'a> {
    fn acquire(active: &'a AtomicBool) -> Option<Self> {
        active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { active })
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

impl<T: Transport, S: KeyValueStore> SessionManager<T, S> {
    /// Try to reattach to the persisted device.
    ///
    /// Returns false immediately when nothing is stored. Never returns an error;
    /// on failure the session is left disconnected.
    pub async fn try_reconnect_last(&self) -> bool {
        let identity = match load_identity(self.store.as_ref()) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                tracing::debug!("No stored device to reconnect to");
                return false;
            }
            Err(e) => {
                tracing::warn!("Ignoring stored device identity: {}", e);
                return false;
            }
        };

        let mut lifecycle = self.lifecycle.lock().await;

        if let Some(device) = lifecycle.device.as_ref() {
            if device.id() == identity.id && self.shared.snapshot().is_connected {
                return true;
            }
        }

        let _flag = ReconnectingFlag::raise(&self.shared);
        tracing::info!(device_id = %identity.id, "Reconnecting to {}", identity);

        let result = match self.find_last_device(&identity).await {
            Ok(device) => self.connect_locked(&mut lifecycle, device).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!(device_id = %identity.id, "Reconnected");
                true
            }
            Err(e) => {
                tracing::info!(device_id = %identity.id, "Reconnect failed: {}", e);
                self.teardown_locked(&mut lifecycle).await;
                false
            }
        }
    }

    async fn find_last_device(&self, identity: &DeviceIdentity) -> Result<T::Device, SensorError> {
        let known = self
            .transport
            .paired_or_connected_devices(&SUPPORTED_SERVICES)
            .await?;

        if let Some(device) = known.into_iter().find(|d| d.id() == identity.id) {
            tracing::debug!("Found {} among paired devices", identity.id);
            return Ok(device);
        }

        tracing::debug!(
            "{} not paired; scanning for up to {:?}",
            identity.id,
            self.config.reconnect_scan_timeout
        );
        self.scan_for(identity).await
    }

    /// Scan until the device appears, the scan ends, or the timeout hits.
    async fn scan_for(&self, identity: &DeviceIdentity) -> Result<T::Device, SensorError> {
        let (found_tx, found_rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(found_tx)));
        let target = identity.id.clone();

        let on_discovered: DiscoveryHandler<T::Device> = Arc::new(move |device: T::Device| {
            if device.id() == target {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(device);
                }
            }
        });

        let timeout = self.config.reconnect_scan_timeout;
        let scan = ScanGuard::new(Arc::clone(&self.transport));

        let outcome = match self
            .transport
            .scan_for_devices(&SUPPORTED_SERVICES, timeout, on_discovered)
            .await
        {
            Ok(()) => match tokio::time::timeout(timeout, found_rx).await {
                Ok(Ok(device)) => Ok(device),
                // Transport dropped the handler: scan ended without a match
                Ok(Err(_)) => Err(SensorError::ReconnectNotFound),
                Err(_) => Err(SensorError::ReconnectTimeout),
            },
            Err(e) => Err(e),
        };

        scan.stop().await;
        outcome
    }

    /// Retry [`SessionManager::try_reconnect_last`] until it succeeds.
    ///
    /// Waits `reconnect_initial_delay`, then retries every
    /// `reconnect_retry_interval`. Gives up when no identity is stored or the
    /// transport reports the adapter unavailable. Only one loop runs at a time;
    /// a second call returns false at once.
    pub async fn run_auto_reconnect(self: Arc<Self>) -> bool {
        let Some(_running) = LoopGuard::acquire(&self.auto_reconnect_active) else {
            tracing::debug!("Auto-reconnect already running");
            return false;
        };

        tokio::time::sleep(self.config.reconnect_initial_delay).await;

        loop {
            if self.try_reconnect_last().await {
                return true;
            }

            if !self.has_stored_identity() {
                tracing::info!("No stored device; auto-reconnect stopped");
                return false;
            }

            if !self.transport.is_available().await {
                tracing::warn!("Bluetooth unavailable; auto-reconnect stopped");
                return false;
            }

            tokio::time::sleep(self.config.reconnect_retry_interval).await;
        }
    }
}
