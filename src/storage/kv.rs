//! Key-value persistence capability and last-device identity helpers.

use crate::sensors::types::DeviceIdentity;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

/// Storage key holding the last connected device's identity.
pub const DEVICE_IDENTITY_KEY: &str = "last_connected_device";

/// Key-value storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Simple string key-value store with last-write-wins semantics.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key; removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().remove(key);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.values.lock().contains_key(key))
    }
}

/// Persist the identity of the device being connected.
pub fn save_identity<S: KeyValueStore + ?Sized>(
    store: &S,
    identity: &DeviceIdentity,
) -> Result<(), StorageError> {
    let json = identity
        .to_json()
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    store.set(DEVICE_IDENTITY_KEY, &json)
}

/// Load the persisted identity.
///
/// `Ok(None)` when nothing is stored; a record that does not parse is a
/// [`StorageError::Serialization`].
pub fn load_identity<S: KeyValueStore + ?Sized>(
    store: &S,
) -> Result<Option<DeviceIdentity>, StorageError> {
    match store.get(DEVICE_IDENTITY_KEY)? {
        Some(json) => DeviceIdentity::from_json(&json)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

pub fn clear_identity<S: KeyValueStore + ?Sized>(store: &S) -> Result<(), StorageError> {
    store.remove(DEVICE_IDENTITY_KEY)
}
