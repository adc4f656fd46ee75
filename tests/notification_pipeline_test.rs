//! Notification-channel sessions through the pipeline, against scripted peripherals.

use std::sync::Arc;
use std::time::Duration;
use telemetry_ingest::config::TelemetryConfig;
use telemetry_ingest::error::TelemetryError;
use telemetry_ingest::events::TelemetryEvent;
use telemetry_ingest::pipeline::{DataHandler, PipelineState};
use telemetry_ingest::transport::mock::{LinkCall, MockNotificationBackend, MockPeripheral};
use telemetry_ingest::transport::notification::{
    DATA_CHARACTERISTIC_UUID, DEVICE_NAME, STATUS_CHARACTERISTIC_UUID,
};
use telemetry_ingest::transport::{Backends, DiscoveredDevice, TransportKind, TransportSpec};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};

const ADDRESS: &str = "24:6F:28:AA:01:9C";

fn setup() -> (DataHandler, Arc<MockNotificationBackend>, MockPeripheral) {
    let backend = Arc::new(MockNotificationBackend::new());
    let peripheral = backend.add_peripheral(DiscoveredDevice {
        name: Some(DEVICE_NAME.to_string()),
        address: ADDRESS.to_string(),
        rssi: Some(-58),
    });
    backend.add_peripheral(DiscoveredDevice {
        name: None,
        address: "11:22:33:44:55:66".to_string(),
        rssi: None,
    });
    let handler = DataHandler::new(
        TelemetryConfig::default(),
        Backends::none().with_notification(backend.clone()),
    );
    (handler, backend, peripheral)
}

fn notification() -> TransportSpec {
    TransportSpec::Notification {
        address: ADDRESS.to_string(),
    }
}

async fn next(events: &mut UnboundedReceiver<TelemetryEvent>) -> TelemetryEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

#[tokio::test]
async fn test_scan_populates_probe_and_publishes_devices() {
    let (handler, _backend, _peripheral) = setup();
    let mut events = handler.subscribe();

    assert!(handler.probe(TransportKind::Notification).unwrap().is_empty());
    let devices = handler.scan_default().await.unwrap();
    assert_eq!(devices.len(), 2);

    match next(&mut events).await {
        TelemetryEvent::DevicesDiscovered(published) => assert_eq!(published, devices),
        other => panic!("unexpected event {:?}", other),
    }

    let targets = handler.probe(TransportKind::Notification).unwrap();
    assert_eq!(targets[0].id, ADDRESS);
    assert_eq!(targets[0].description, format!("{} (-58 dBm)", DEVICE_NAME));
    assert_eq!(targets[1].description, "Unknown");
    assert_eq!(handler.state(), PipelineState::Idle);
}

#[tokio::test]
async fn test_notifications_become_records() {
    let (handler, _backend, peripheral) = setup();
    let mut events = handler.subscribe();

    handler.connect(notification()).await.unwrap();
    assert_eq!(
        next(&mut events).await,
        TelemetryEvent::Status {
            connected: true,
            message: format!("Connected to {}", ADDRESS)
        }
    );
    assert!(peripheral.is_subscribed(DATA_CHARACTERISTIC_UUID));
    assert!(peripheral.is_subscribed(STATUS_CHARACTERISTIC_UUID));

    let frame = br#"{"timestamp": 5000, "rpm": 2500, "speed": 30, "system_state": "ACCELERATING"}"#;
    assert!(peripheral.notify(DATA_CHARACTERISTIC_UUID, &frame[..]).await);
    assert!(peripheral.notify(STATUS_CHARACTERISTIC_UUID, &b"OK"[..]).await);

    match next(&mut events).await {
        TelemetryEvent::Record(record) => {
            assert_eq!(record.timestamp_ms(), 5000);
            assert_eq!(record.engine_rpm(), 2500);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Scanning is refused while a session is live.
    assert!(matches!(
        handler.scan_default().await,
        Err(TelemetryError::Busy(PipelineState::Connected))
    ));

    handler.disconnect().await.unwrap();
    assert_eq!(
        peripheral.calls(),
        vec![
            LinkCall::Connect,
            LinkCall::Subscribe(DATA_CHARACTERISTIC_UUID),
            LinkCall::Subscribe(STATUS_CHARACTERISTIC_UUID),
            LinkCall::Unsubscribe(DATA_CHARACTERISTIC_UUID),
            LinkCall::Unsubscribe(STATUS_CHARACTERISTIC_UUID),
            LinkCall::Disconnect,
        ]
    );
    assert!(!peripheral.is_connected());
}

#[tokio::test]
async fn test_truncated_and_malformed_payloads_do_not_corrupt_later_ones() {
    let (handler, _backend, peripheral) = setup();
    let mut events = handler.subscribe();
    handler.connect(notification()).await.unwrap();
    let _ = next(&mut events).await; // connected

    // MTU-truncated object, then garbage, then two complete objects.
    assert!(peripheral.notify(DATA_CHARACTERISTIC_UUID, &br#"{"timestamp": 1, "rp"#[..]).await);
    assert!(peripheral.notify(DATA_CHARACTERISTIC_UUID, &br#"{"timestamp": oops}"#[..]).await);
    assert!(peripheral.notify(DATA_CHARACTERISTIC_UUID, &br#"{"timestamp": 2, "rpm": 900}"#[..]).await);
    assert!(peripheral.notify(DATA_CHARACTERISTIC_UUID, &br#"{"timestamp": 3, "rpm": 950}"#[..]).await);

    let mut timestamps = Vec::new();
    while timestamps.len() < 2 {
        match next(&mut events).await {
            TelemetryEvent::Record(record) => timestamps.push(record.timestamp_ms()),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(timestamps, vec![2, 3]);

    handler.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_remote_disconnect_reported_once() {
    let (handler, _backend, peripheral) = setup();
    let mut events = handler.subscribe();
    let mut state = handler.watch_state();

    handler.connect(notification()).await.unwrap();
    let _ = next(&mut events).await; // connected

    peripheral.drop_connection();

    assert_eq!(
        next(&mut events).await,
        TelemetryEvent::Error("Device disconnected".into())
    );
    assert_eq!(
        next(&mut events).await,
        TelemetryEvent::Status {
            connected: false,
            message: "Disconnected: Device disconnected".into()
        }
    );
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == PipelineState::Idle))
        .await
        .unwrap()
        .unwrap();

    handler.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_scan_waits_for_radio_to_settle() {
    let (handler, backend, _peripheral) = setup();

    handler.connect(notification()).await.unwrap();
    let before_close = Instant::now();
    handler.disconnect().await.unwrap();

    handler.scan_default().await.unwrap();
    let scans = backend.scan_times();
    assert_eq!(scans.len(), 1);
    let settle = Duration::from_millis(handler.config().notification.settle_delay_ms);
    assert!(scans[0] >= before_close + settle);
    assert!(scans[0] < before_close + settle + Duration::from_millis(100));

    // Long after the close there is nothing left to wait for.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let requested = Instant::now();
    handler.scan_default().await.unwrap();
    assert_eq!(backend.scan_times()[1], requested);
}

#[tokio::test]
async fn test_refused_connection_leaves_pipeline_idle() {
    let (handler, _backend, peripheral) = setup();
    peripheral.refuse_connect(true);
    let mut events = handler.subscribe();

    let err = handler.connect(notification()).await.unwrap_err();
    assert!(matches!(err, TelemetryError::ConnectionFailed { .. }));
    assert_eq!(handler.state(), PipelineState::Idle);
    assert_eq!(
        next(&mut events).await,
        TelemetryEvent::Status {
            connected: false,
            message: format!("Failed to connect to {}: Connection refused", ADDRESS)
        }
    );
}

#[tokio::test]
async fn test_without_radio_backend() {
    let handler = DataHandler::new(TelemetryConfig::default(), Backends::none());
    assert!(matches!(
        handler.scan_default().await,
        Err(TelemetryError::BackendUnavailable(TransportKind::Notification))
    ));
    assert!(matches!(
        handler.connect(notification()).await,
        Err(TelemetryError::BackendUnavailable(TransportKind::Notification))
    ));
    assert!(matches!(
        handler.scan(TransportKind::Replay, Duration::from_secs(1)).await,
        Err(TelemetryError::Unsupported(_))
    ));
}
