//! Session lifecycle against the scripted transport.

use super::mock_transport::{Call, MockDevice, MockTransport};
use cpsense::sensors::observer::PropertyChange;
use cpsense::sensors::protocol::{
    MeasurementKind, CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID, CYCLING_POWER_MEASUREMENT_UUID,
    CYCLING_POWER_SERVICE_UUID,
};
use cpsense::sensors::transport::{GattCharacteristic, GattService, TransportEvent};
use cpsense::sensors::types::{DeviceIdentity, SensorConfig, SensorError, SessionPhase};
use cpsense::storage::kv::{load_identity, save_identity, MemoryStore};
use cpsense::SessionManager;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

type Session = SessionManager<MockTransport, MemoryStore>;

fn device_a() -> MockDevice {
    MockDevice::new("AA:BB:CC:DD:EE:01", "Stages Power L")
}

fn session_with(transport: MockTransport, config: SensorConfig) -> (Arc<MockTransport>, Arc<MemoryStore>, Session) {
    let transport = Arc::new(transport);
    let store = Arc::new(MemoryStore::new());
    let session = SessionManager::new(Arc::clone(&transport), Arc::clone(&store), config);
    (transport, store, session)
}

fn session() -> (Arc<MockTransport>, Arc<MemoryStore>, Session) {
    session_with(MockTransport::cycling_power(), SensorConfig::default())
}

/// Power + crank payload.
fn cpm(power: i16, revolutions: u16, event_time: u16) -> Vec<u8> {
    let mut data = vec![0x20, 0x00];
    data.extend_from_slice(&power.to_le_bytes());
    data.extend_from_slice(&revolutions.to_le_bytes());
    data.extend_from_slice(&event_time.to_le_bytes());
    data
}

#[tokio::test]
async fn test_connect_streams_and_persists_identity() {
    let (transport, store, session) = session();

    session.connect(device_a()).await.unwrap();

    assert!(session.is_connected());
    assert_eq!(session.phase(), SessionPhase::Subscribed);
    assert_eq!(
        load_identity(store.as_ref()).unwrap(),
        Some(DeviceIdentity::new(
            "AA:BB:CC:DD:EE:01",
            Some("Stages Power L".to_string()),
            true
        ))
    );
    assert_eq!(
        transport.calls(),
        vec![
            Call::Connect("AA:BB:CC:DD:EE:01".to_string()),
            Call::DiscoverServices("AA:BB:CC:DD:EE:01".to_string()),
            Call::DiscoverCharacteristics(CYCLING_POWER_SERVICE_UUID),
            Call::Subscribe(CYCLING_POWER_MEASUREMENT_UUID),
        ]
    );

    assert!(transport.notify(&cpm(245, 10, 1024)));
    assert_eq!(session.power(), 245);
    assert_eq!(session.cadence(), 0);

    transport.notify(&cpm(250, 11, 2048));
    assert_eq!(session.power(), 250);
    assert_eq!(session.cadence(), 60);
    assert!(session
        .decoder_state(MeasurementKind::CyclingPower)
        .has_prior_sample());
}

#[tokio::test]
async fn test_malformed_notification_keeps_session() {
    let (transport, _, session) = session();
    session.connect(device_a()).await.unwrap();

    transport.notify(&cpm(180, 5, 512));
    transport.notify(&[0x20, 0x00]);

    assert!(session.is_connected());
    assert_eq!(session.power(), 180);
}

#[tokio::test]
async fn test_unsolicited_disconnect_keeps_identity() {
    let (transport, store, session) = session();
    session.connect(device_a()).await.unwrap();
    transport.notify(&cpm(200, 1, 1024));
    transport.notify(&cpm(200, 2, 2048));
    transport.drop_link(&device_a().id);
    transport.clear_calls();

    let dropped = session
        .handle_transport_event(TransportEvent::DeviceDisconnected(device_a().id))
        .await;

    assert!(dropped);
    assert!(!session.is_connected());
    assert_eq!(session.power(), 0);
    assert_eq!(session.cadence(), 0);
    assert!(!session
        .decoder_state(MeasurementKind::CyclingPower)
        .has_prior_sample());
    assert!(load_identity(store.as_ref()).unwrap().is_some());
    assert!(session.connected_device().await.is_none());
    // Link already gone: the subscription is released, no disconnect is sent
    assert_eq!(
        transport.calls(),
        vec![
            Call::IsConnected(device_a().id),
            Call::Unsubscribe(CYCLING_POWER_MEASUREMENT_UUID),
        ]
    );
    assert!(!transport.has_subscription());

    // Values from the dead subscription are ignored
    transport.notify(&cpm(400, 3, 3072));
    assert_eq!(session.power(), 0);
}

#[tokio::test]
async fn test_disconnect_event_for_live_link_ignored() {
    let (transport, _, session) = session();
    session.connect(device_a()).await.unwrap();
    transport.notify(&cpm(200, 1, 1024));

    let dropped = session
        .handle_transport_event(TransportEvent::DeviceDisconnected(device_a().id))
        .await;

    assert!(!dropped);
    assert!(session.is_connected());
    assert_eq!(session.power(), 200);
    assert!(transport.has_subscription());
    assert_eq!(transport.count(&Call::Unsubscribe(CYCLING_POWER_MEASUREMENT_UUID)), 0);
}

#[tokio::test]
async fn test_reconnect_to_same_device_survives_own_disconnect_event() {
    let (transport, _, session) = session();
    let session = Arc::new(session);
    let listener = session.spawn_event_listener();

    session.connect(device_a()).await.unwrap();
    // Reconnecting to the same sensor tears down first; the stack reports that disconnect
    session.connect(device_a()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(transport.notify(&[0x00, 0x00, 0xC8, 0x00]));
    assert!(session.is_connected());
    assert_eq!(session.power(), 200);
    assert!(transport.has_subscription());
    assert_eq!(transport.count(&Call::Connect(device_a().id)), 2);
    assert_eq!(transport.count(&Call::Disconnect(device_a().id)), 1);
    assert_eq!(transport.count(&Call::IsConnected(device_a().id)), 1);
    listener.abort();
}

#[tokio::test]
async fn test_disconnect_event_for_other_device_ignored() {
    let (_, _, session) = session();
    session.connect(device_a()).await.unwrap();

    let dropped = session
        .handle_transport_event(TransportEvent::DeviceDisconnected("11:22:33:44:55:66".into()))
        .await;

    assert!(!dropped);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_explicit_disconnect_forgets_device() {
    let (transport, store, session) = session();
    session.connect(device_a()).await.unwrap();
    transport.notify(&cpm(300, 1, 1024));

    session.disconnect().await.unwrap();

    assert!(!session.is_connected());
    assert_eq!(session.power(), 0);
    assert_eq!(session.phase(), SessionPhase::Idle);
    assert!(!transport.has_subscription());
    assert_eq!(transport.count(&Call::Unsubscribe(CYCLING_POWER_MEASUREMENT_UUID)), 1);
    assert_eq!(transport.count(&Call::Disconnect(device_a().id)), 1);
    assert_eq!(load_identity(store.as_ref()).unwrap(), None);
    assert!(session.connected_device().await.is_none());
}

#[tokio::test]
async fn test_disconnect_when_idle_is_safe() {
    let (transport, _, session) = session();

    session.disconnect().await.unwrap();
    session.disconnect().await.unwrap();

    assert!(!session.is_connected());
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_disconnect_transport_failure_still_clears_state() {
    let (transport, store, session) = session();
    session.connect(device_a()).await.unwrap();
    transport.notify(&cpm(220, 1, 1024));
    transport.set_fail_disconnect(true);

    session.disconnect().await.unwrap();

    assert!(!session.is_connected());
    assert_eq!(session.power(), 0);
    assert_eq!(load_identity(store.as_ref()).unwrap(), None);
}

#[tokio::test]
async fn test_missing_service_fails_with_cleanup() {
    let (transport, store, session) = session();
    let battery = uuid::Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);
    transport.set_services(vec![GattService { uuid: battery }]);

    let err = session.connect(device_a()).await.unwrap_err();

    assert!(matches!(err, SensorError::ConnectionFailed(_)));
    assert!(matches!(err.root_cause(), SensorError::ServiceNotFound));
    assert!(!session.is_connected());
    assert_eq!(session.phase(), SessionPhase::Failed);
    assert_eq!(transport.count(&Call::Disconnect(device_a().id)), 1);
    assert!(session.connected_device().await.is_none());
    // Identity was persisted before the attempt and stays
    assert!(load_identity(store.as_ref()).unwrap().is_some());
}

#[tokio::test]
async fn test_missing_characteristic_fails_with_cleanup() {
    let (transport, _, session) = session();
    transport.set_characteristics(vec![GattCharacteristic {
        uuid: uuid::Uuid::from_u128(0x0000_2a65_0000_1000_8000_0080_5f9b_34fb),
        service_uuid: CYCLING_POWER_SERVICE_UUID,
    }]);

    let err = session.connect(device_a()).await.unwrap_err();

    assert!(matches!(err.root_cause(), SensorError::CharacteristicNotFound));
    assert!(!transport.has_subscription());
    assert_eq!(transport.count(&Call::Disconnect(device_a().id)), 1);
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_transport_connect_failure_is_wrapped() {
    let (transport, store, session) = session();
    transport.set_fail_connect(true);

    let err = session.connect(device_a()).await.unwrap_err();

    match &err {
        SensorError::ConnectionFailed(cause) => {
            assert!(matches!(cause.as_ref(), SensorError::Transport(_)))
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!session.is_connected());
    assert!(load_identity(store.as_ref()).unwrap().is_some());
}

#[tokio::test]
async fn test_connect_timeout() {
    let config = SensorConfig {
        connection_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let (transport, _, session) = session_with(MockTransport::cycling_power(), config);
    transport.set_connect_delay(Duration::from_secs(5));

    let err = session.connect(device_a()).await.unwrap_err();

    assert!(matches!(err.root_cause(), SensorError::ConnectionTimeout));
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let (transport, store, session) = session();
    let device_b = MockDevice::new("AA:BB:CC:DD:EE:02", "Favero Assioma");

    session.connect(device_a()).await.unwrap();
    session.connect(device_b.clone()).await.unwrap();

    assert_eq!(transport.count(&Call::Disconnect(device_a().id)), 1);
    assert_eq!(session.connected_device().await, Some(device_b.clone()));
    assert_eq!(
        load_identity(store.as_ref()).unwrap().map(|i| i.id),
        Some(device_b.id)
    );
}

#[tokio::test]
async fn test_csc_fallback() {
    let (transport, _, session) = session_with(MockTransport::speed_cadence(), SensorConfig::default());

    session.connect(device_a()).await.unwrap();

    assert!(transport
        .calls()
        .contains(&Call::DiscoverCharacteristics(CSC_SERVICE_UUID)));
    assert!(transport.calls().contains(&Call::Subscribe(CSC_MEASUREMENT_UUID)));

    // Crank-only CSC: 2 revolutions in 1.5 s = 80 RPM
    transport.notify(&[0x02, 0x0A, 0x00, 0x00, 0x04]);
    transport.notify(&[0x02, 0x0C, 0x00, 0x00, 0x0A]);

    assert_eq!(session.cadence(), 80);
    assert_eq!(session.power(), 0);
}

#[tokio::test]
async fn test_power_and_csc_services_both_stream() {
    let (transport, _, session) =
        session_with(MockTransport::power_and_cadence(), SensorConfig::default());

    session.connect(device_a()).await.unwrap();

    assert_eq!(
        transport.calls(),
        vec![
            Call::Connect(device_a().id),
            Call::DiscoverServices(device_a().id),
            Call::DiscoverCharacteristics(CYCLING_POWER_SERVICE_UUID),
            Call::DiscoverCharacteristics(CSC_SERVICE_UUID),
            Call::Subscribe(CYCLING_POWER_MEASUREMENT_UUID),
            Call::Subscribe(CSC_MEASUREMENT_UUID),
        ]
    );
    assert_eq!(transport.subscription_count(), 2);

    // Power meter sends power only; cadence comes from the CSC service
    transport.notify_on(CYCLING_POWER_MEASUREMENT_UUID, &[0x00, 0x00, 0xFA, 0x00]);
    transport.notify_on(CSC_MEASUREMENT_UUID, &[0x02, 0x0A, 0x00, 0x00, 0x04]);
    transport.notify_on(CSC_MEASUREMENT_UUID, &[0x02, 0x0C, 0x00, 0x00, 0x0A]);
    transport.notify_on(CYCLING_POWER_MEASUREMENT_UUID, &[0x00, 0x00, 0x04, 0x01]);

    assert_eq!(session.power(), 260);
    assert_eq!(session.cadence(), 80);
    assert!(session
        .decoder_state(MeasurementKind::SpeedCadence)
        .has_prior_sample());
    assert!(!session
        .decoder_state(MeasurementKind::CyclingPower)
        .has_prior_sample());

    session.disconnect().await.unwrap();

    assert_eq!(transport.count(&Call::Unsubscribe(CYCLING_POWER_MEASUREMENT_UUID)), 1);
    assert_eq!(transport.count(&Call::Unsubscribe(CSC_MEASUREMENT_UUID)), 1);
    assert!(!transport.has_subscription());
}

#[tokio::test]
async fn test_csc_measurement_inside_power_service() {
    let (transport, _, session) = session();
    transport.set_characteristics(vec![
        GattCharacteristic {
            uuid: CYCLING_POWER_MEASUREMENT_UUID,
            service_uuid: CYCLING_POWER_SERVICE_UUID,
        },
        GattCharacteristic {
            uuid: CSC_MEASUREMENT_UUID,
            service_uuid: CYCLING_POWER_SERVICE_UUID,
        },
    ]);

    session.connect(device_a()).await.unwrap();

    assert_eq!(transport.subscription_count(), 2);
    assert_eq!(transport.count(&Call::DiscoverCharacteristics(CYCLING_POWER_SERVICE_UUID)), 1);

    transport.notify_on(CSC_MEASUREMENT_UUID, &[0x02, 0x0A, 0x00, 0x00, 0x04]);
    transport.notify_on(CSC_MEASUREMENT_UUID, &[0x02, 0x0C, 0x00, 0x00, 0x0A]);
    assert_eq!(session.cadence(), 80);
}

#[tokio::test]
async fn test_csc_service_without_characteristic_is_skipped() {
    let (transport, _, session) =
        session_with(MockTransport::power_and_cadence(), SensorConfig::default());
    transport.set_characteristics(vec![GattCharacteristic {
        uuid: CYCLING_POWER_MEASUREMENT_UUID,
        service_uuid: CYCLING_POWER_SERVICE_UUID,
    }]);

    session.connect(device_a()).await.unwrap();

    assert!(session.is_connected());
    assert_eq!(transport.subscription_count(), 1);
    assert!(transport.calls().contains(&Call::DiscoverCharacteristics(CSC_SERVICE_UUID)));
}

#[tokio::test]
async fn test_cadence_goes_stale() {
    let config = SensorConfig {
        cadence_stale_after: Duration::from_millis(100),
        ..Default::default()
    };
    let (transport, _, session) = session_with(MockTransport::cycling_power(), config);
    session.connect(device_a()).await.unwrap();

    transport.notify(&cpm(200, 1, 1024));
    transport.notify(&cpm(200, 2, 2048));
    assert_eq!(session.cadence(), 60);

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Coasting: crank counters repeat
    transport.notify(&cpm(0, 2, 2048));
    assert_eq!(session.cadence(), 0);
    assert_eq!(session.power(), 0);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_listeners_see_named_changes() {
    let (transport, _, session) = session();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.add_listener(Arc::new(move |change: &PropertyChange| {
        sink.lock().push(change.name());
    }));
    let mut rx = session.subscribe();

    session.connect(device_a()).await.unwrap();
    transport.notify(&cpm(150, 1, 1024));

    let names = seen.lock().clone();
    assert!(names.contains(&"IsConnected"));
    assert!(names.contains(&"Power"));

    let mut connected = false;
    while let Ok(change) = rx.try_recv() {
        if change == PropertyChange::IsConnected(true) {
            connected = true;
        }
    }
    assert!(connected);
}

#[tokio::test]
async fn test_shutdown_keeps_identity() {
    let (transport, store, session) = session();
    session.connect(device_a()).await.unwrap();

    session.shutdown().await;

    assert!(!session.is_connected());
    assert_eq!(transport.count(&Call::Disconnect(device_a().id)), 1);
    assert!(load_identity(store.as_ref()).unwrap().is_some());
}

#[tokio::test]
async fn test_identity_written_before_connect_attempt() {
    let (transport, store, session) = session();
    save_identity(
        store.as_ref(),
        &DeviceIdentity::new("00:00:00:00:00:01", None, true),
    )
    .unwrap();
    transport.set_fail_connect(true);

    assert!(session.connect(device_a()).await.is_err());

    // Identity is written before the attempt starts
    assert_eq!(
        load_identity(store.as_ref()).unwrap().map(|i| i.id),
        Some(device_a().id)
    );
}
