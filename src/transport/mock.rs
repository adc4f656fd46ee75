//! In-memory backends.
//!
//! Simulated devices for tests and for embedders running without hardware. All mock
//! I/O is async and uses Tokio primitives only.
//!
//! # Available Mocks
//!
//! - [`MockSerialBackend`] - named ports backed by `tokio::io::duplex` pipes; the test
//!   keeps the device end and writes into it
//! - [`MockNotificationBackend`] - scan results plus scripted [`MockPeripheral`]s that
//!   push notifications, drop the link and record every call made on them

use super::notification::{NotificationBackend, NotificationLink};
use super::serial::{ByteStream, SerialBackend};
use super::{DiscoveredDevice, Target};
use crate::error::{AppResult, TelemetryError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

const PIPE_CAPACITY: usize = 64 * 1024;
const NOTIFY_QUEUE: usize = 64;

// =============================================================================
// MockSerialBackend
// =============================================================================

/// Serial backend with in-memory ports.
#[derive(Default)]
pub struct MockSerialBackend {
    ports: Mutex<HashMap<String, Option<DuplexStream>>>,
    opens: Mutex<Vec<(String, u32)>>,
}

impl MockSerialBackend {
    /// Backend with no ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a port and return its device end.
    ///
    /// Bytes written to the returned stream are read by the session; dropping it is an
    /// end-of-file on the host side. Re-adding a name replaces the previous port.
    pub fn add_port(&self, name: &str) -> DuplexStream {
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        self.ports.lock().insert(name.to_string(), Some(host));
        device
    }

    /// Every `open` call so far as `(port, baud_rate)`.
    pub fn opens(&self) -> Vec<(String, u32)> {
        self.opens.lock().clone()
    }
}

#[async_trait]
impl SerialBackend for MockSerialBackend {
    fn available_ports(&self) -> AppResult<Vec<Target>> {
        let mut ports: Vec<Target> = self
            .ports
            .lock()
            .keys()
            .map(|name| Target {
                id: name.clone(),
                description: "Mock serial port".to_string(),
            })
            .collect();
        ports.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(ports)
    }

    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<ByteStream> {
        self.opens.lock().push((port.to_string(), baud_rate));
        let mut ports = self.ports.lock();
        let slot = ports.get_mut(port).ok_or_else(|| TelemetryError::ConnectionFailed {
            target: port.to_string(),
            reason: "No such port".to_string(),
        })?;
        let host = slot.take().ok_or_else(|| TelemetryError::ConnectionFailed {
            target: port.to_string(),
            reason: "Port is busy".to_string(),
        })?;
        Ok(Box::new(host))
    }
}

// =============================================================================
// MockNotificationBackend
// =============================================================================

/// A call made on a [`MockPeripheral`]'s link, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    /// `connect(address)` on the backend.
    Connect,
    /// `subscribe(characteristic)`.
    Subscribe(Uuid),
    /// `unsubscribe(characteristic)`.
    Unsubscribe(Uuid),
    /// `disconnect()`.
    Disconnect,
}

#[derive(Default)]
struct Faults {
    refuse_connect: bool,
    fail_subscribe: HashSet<Uuid>,
    fail_unsubscribe: bool,
    fail_disconnect: bool,
}

struct PeripheralState {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Vec<u8>>>>,
    connected: watch::Sender<bool>,
    calls: Mutex<Vec<LinkCall>>,
    faults: Mutex<Faults>,
}

impl PeripheralState {
    fn record(&self, call: LinkCall) {
        self.calls.lock().push(call);
    }
}

/// Device-side handle of a scripted peripheral.
#[derive(Clone)]
pub struct MockPeripheral {
    state: Arc<PeripheralState>,
}

impl MockPeripheral {
    fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            state: Arc::new(PeripheralState {
                subscribers: Mutex::new(HashMap::new()),
                connected,
                calls: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    /// Push one notification on `characteristic`. Returns false if nobody is subscribed.
    pub async fn notify(&self, characteristic: Uuid, payload: impl Into<Vec<u8>>) -> bool {
        let sender = self.state.subscribers.lock().get(&characteristic).cloned();
        match sender {
            Some(tx) => tx.send(payload.into()).await.is_ok(),
            None => false,
        }
    }

    /// Simulate the peripheral going away (out of range, powered off).
    pub fn drop_connection(&self) {
        self.state.connected.send_replace(false);
    }

    /// Whether a central is connected.
    pub fn is_connected(&self) -> bool {
        *self.state.connected.borrow()
    }

    /// Whether `characteristic` currently has a subscriber.
    pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
        self.state.subscribers.lock().contains_key(&characteristic)
    }

    /// Calls made so far.
    pub fn calls(&self) -> Vec<LinkCall> {
        self.state.calls.lock().clone()
    }

    /// Refuse the next connection attempts.
    pub fn refuse_connect(&self, refuse: bool) {
        self.state.faults.lock().refuse_connect = refuse;
    }

    /// Make `subscribe(characteristic)` fail.
    pub fn fail_subscribe(&self, characteristic: Uuid) {
        self.state.faults.lock().fail_subscribe.insert(characteristic);
    }

    /// Make every `unsubscribe` fail.
    pub fn fail_unsubscribe(&self, fail: bool) {
        self.state.faults.lock().fail_unsubscribe = fail;
    }

    /// Make `disconnect` fail.
    pub fn fail_disconnect(&self, fail: bool) {
        self.state.faults.lock().fail_disconnect = fail;
    }
}

struct MockLink {
    state: Arc<PeripheralState>,
}

#[async_trait]
impl NotificationLink for MockLink {
    async fn subscribe(&self, characteristic: Uuid) -> AppResult<mpsc::Receiver<Vec<u8>>> {
        self.state.record(LinkCall::Subscribe(characteristic));
        if self.state.faults.lock().fail_subscribe.contains(&characteristic) {
            return Err(TelemetryError::Notification(format!(
                "Characteristic {} does not support notifications",
                characteristic
            )));
        }
        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE);
        self.state.subscribers.lock().insert(characteristic, tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> AppResult<()> {
        self.state.record(LinkCall::Unsubscribe(characteristic));
        if self.state.faults.lock().fail_unsubscribe {
            return Err(TelemetryError::Notification("Unsubscribe rejected".to_string()));
        }
        self.state.subscribers.lock().remove(&characteristic);
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        self.state.record(LinkCall::Disconnect);
        self.state.subscribers.lock().clear();
        if self.state.faults.lock().fail_disconnect {
            return Err(TelemetryError::Notification("Disconnect rejected".to_string()));
        }
        self.state.connected.send_replace(false);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.state.connected.borrow()
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        // The flag is "connected"; the link reports loss when it turns false.
        self.state.connected.subscribe()
    }
}

/// Notification backend with scripted peripherals.
#[derive(Default)]
pub struct MockNotificationBackend {
    advertised: Mutex<Vec<DiscoveredDevice>>,
    peripherals: Mutex<HashMap<String, MockPeripheral>>,
    scans: Mutex<Vec<Instant>>,
    scan_latency: Mutex<Duration>,
}

impl MockNotificationBackend {
    /// Backend with nothing in range.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a peripheral in range and return its scripting handle.
    pub fn add_peripheral(&self, device: DiscoveredDevice) -> MockPeripheral {
        let peripheral = MockPeripheral::new();
        self.peripherals
            .lock()
            .insert(device.address.clone(), peripheral.clone());
        self.advertised.lock().push(device);
        peripheral
    }

    /// How long each scan takes (capped by the scan timeout).
    pub fn set_scan_latency(&self, latency: Duration) {
        *self.scan_latency.lock() = latency;
    }

    /// When each scan started.
    pub fn scan_times(&self) -> Vec<Instant> {
        self.scans.lock().clone()
    }
}

#[async_trait]
impl NotificationBackend for MockNotificationBackend {
    async fn scan(&self, timeout: Duration) -> AppResult<Vec<DiscoveredDevice>> {
        self.scans.lock().push(Instant::now());
        let latency = *self.scan_latency.lock();
        tokio::time::sleep(latency.min(timeout)).await;
        Ok(self.advertised.lock().clone())
    }

    async fn connect(&self, address: &str) -> AppResult<Box<dyn NotificationLink>> {
        let peripheral = self
            .peripherals
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| TelemetryError::ConnectionFailed {
                target: address.to_string(),
                reason: "Device not found".to_string(),
            })?;
        peripheral.state.record(LinkCall::Connect);
        if peripheral.state.faults.lock().refuse_connect {
            return Err(TelemetryError::ConnectionFailed {
                target: address.to_string(),
                reason: "Connection refused".to_string(),
            });
        }
        peripheral.state.connected.send_replace(true);
        Ok(Box::new(MockLink {
            state: peripheral.state.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serial_port_can_only_be_opened_once() {
        let backend = MockSerialBackend::new();
        let _device = backend.add_port("/dev/ttyMOCK0");
        assert!(backend.open("/dev/ttyMOCK0", 115_200).await.is_ok());
        assert!(matches!(
            backend.open("/dev/ttyMOCK0", 115_200).await,
            Err(TelemetryError::ConnectionFailed { .. })
        ));
        assert_eq!(backend.opens().len(), 2);
        assert_eq!(backend.available_ports().unwrap()[0].id, "/dev/ttyMOCK0");
    }

    #[tokio::test]
    async fn peripheral_delivers_to_subscribers() {
        let backend = MockNotificationBackend::new();
        let peripheral = backend.add_peripheral(DiscoveredDevice {
            name: Some("Test".into()),
            address: "AA".into(),
            rssi: Some(-60),
        });
        let link = backend.connect("AA").await.unwrap();
        let characteristic = Uuid::from_u128(1);
        let mut rx = link.subscribe(characteristic).await.unwrap();

        assert!(peripheral.notify(characteristic, b"{}".to_vec()).await);
        assert_eq!(rx.recv().await, Some(b"{}".to_vec()));

        let mut lost = link.disconnected();
        peripheral.drop_connection();
        lost.changed().await.unwrap();
        assert!(!*lost.borrow());
        assert!(!link.is_connected());
    }
}
