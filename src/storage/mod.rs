//! Storage module for database, key-value persistence and configuration.

pub mod config;
pub mod database;
pub mod kv;
pub mod schema;

pub use config::{AppConfig, ConfigError, SensorSettings};
pub use database::{Database, DatabaseError};
pub use kv::{KeyValueStore, MemoryStore, StorageError};
