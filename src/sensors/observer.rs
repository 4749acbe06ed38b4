//! Property-change notifications for the session's observable state.

use crate::sensors::types::{SessionPhase, SessionState};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A change to one observable property, carrying the new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyChange {
    Power(i32),
    Cadence(u32),
    IsConnected(bool),
    IsReconnecting(bool),
    Phase(SessionPhase),
}

impl PropertyChange {
    /// Property name as exposed to observers.
    pub fn name(&self) -> &'static str {
        match self {
            PropertyChange::Power(_) => "Power",
            PropertyChange::Cadence(_) => "Cadence",
            PropertyChange::IsConnected(_) => "IsConnected",
            PropertyChange::IsReconnecting(_) => "IsReconnecting",
            PropertyChange::Phase(_) => "Phase",
        }
    }

    /// Changes between two states, in a fixed order.
    pub fn diff(before: &SessionState, after: &SessionState) -> Vec<PropertyChange> {
        let mut changes = Vec::new();
        if before.phase != after.phase {
            changes.push(PropertyChange::Phase(after.phase));
        }
        if before.power != after.power {
            changes.push(PropertyChange::Power(after.power));
        }
        if before.cadence != after.cadence {
            changes.push(PropertyChange::Cadence(after.cadence));
        }
        if before.is_connected != after.is_connected {
            changes.push(PropertyChange::IsConnected(after.is_connected));
        }
        if before.is_reconnecting != after.is_reconnecting {
            changes.push(PropertyChange::IsReconnecting(after.is_reconnecting));
        }
        changes
    }
}

/// Callback invoked for every property change.
pub type PropertyListener = Arc<dyn Fn(&PropertyChange) + Send + Sync>;

/// Registered listeners plus a broadcast channel for async consumers.
pub struct Observers {
    listeners: Mutex<Vec<PropertyListener>>,
    change_tx: broadcast::Sender<PropertyChange>,
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

impl Observers {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self {
            listeners: Mutex::new(Vec::new()),
            change_tx,
        }
    }

    pub fn add_listener(&self, listener: PropertyListener) {
        self.listeners.lock().push(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PropertyChange> {
        self.change_tx.subscribe()
    }

    /// Deliver changes to every listener and broadcast subscriber.
    ///
    /// Must be called without holding the session state lock.
    pub fn notify(&self, changes: &[PropertyChange]) {
        if changes.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        for change in changes {
            for listener in &listeners {
                listener(change);
            }
            // No receivers is fine
            let _ = self.change_tx.send(*change);
        }
    }
}
