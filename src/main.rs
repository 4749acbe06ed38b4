//! CPSense - BLE cycling power session manager
//!
//! Main entry point: attaches to the remembered power meter (or the first one
//! found) and logs live readings until interrupted.

use anyhow::Context;
use cpsense::sensors::protocol::SUPPORTED_SERVICES;
use cpsense::sensors::{BtleDevice, BtleTransport, DiscoveryHandler, PropertyChange, Transport};
use cpsense::storage::config::{get_config_path, load_config, save_config};
use cpsense::{Database, SensorConfig, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FIRST_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CPSense v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config().context("loading configuration")?;
    if !get_config_path().exists() {
        // First start: write the defaults out so they can be edited
        match save_config(&config) {
            Ok(()) => tracing::info!("Wrote default configuration to {:?}", get_config_path()),
            Err(e) => tracing::warn!("Failed to write default configuration: {}", e),
        }
    }
    let store = Arc::new(
        Database::open(&config.database_path()).context("opening settings database")?,
    );
    let transport = Arc::new(
        BtleTransport::new()
            .await
            .context("initializing Bluetooth")?,
    );

    let session = Arc::new(SessionManager::new(
        Arc::clone(&transport),
        store,
        SensorConfig::from(&config.sensors),
    ));

    session.add_listener(Arc::new(|change: &PropertyChange| match change {
        PropertyChange::Power(watts) => tracing::info!("Power: {} W", watts),
        PropertyChange::Cadence(rpm) => tracing::info!("Cadence: {} rpm", rpm),
        other => tracing::debug!("{:?}", other),
    }));

    let events = session.spawn_event_listener();

    if session.has_stored_identity() {
        tokio::spawn(Arc::clone(&session).run_auto_reconnect());
    } else if let Some(device) = first_sensor(transport.as_ref()).await {
        if let Err(e) = session.connect(device).await {
            tracing::error!("{}", e);
        }
    } else {
        tracing::warn!("No cycling power sensor found");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    session.shutdown().await;
    events.abort();

    Ok(())
}

/// Scan for the first advertising power or speed/cadence sensor.
async fn first_sensor(transport: &BtleTransport) -> Option<BtleDevice> {
    tracing::info!("Scanning for sensors...");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_discovered: DiscoveryHandler<BtleDevice> = Arc::new(move |device: BtleDevice| {
        let _ = tx.send(device);
    });

    if let Err(e) = transport
        .scan_for_devices(&SUPPORTED_SERVICES, FIRST_SCAN_TIMEOUT, on_discovered)
        .await
    {
        tracing::error!("Scan failed: {}", e);
        return None;
    }

    let found = tokio::time::timeout(FIRST_SCAN_TIMEOUT, rx.recv())
        .await
        .ok()
        .flatten();

    let _ = transport.stop_scanning().await;
    found
}
