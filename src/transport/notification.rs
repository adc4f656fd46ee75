//! Notification-channel adapter.
//!
//! Talks to a peripheral that pushes JSON fragments as notifications on a data
//! characteristic. Each payload is decoded on its own through the session's
//! [`RecordStream`]; a truncated object is dropped at the end of its payload rather than
//! joined with the next one. A second status characteristic carries free-form device
//! status and is only logged.
//!
//! Remote disconnects are observed through the link's disconnect watch and produce the
//! same transition as a local disconnect. A keep-alive tick additionally checks
//! [`NotificationLink::is_connected`].
//!
//! # Teardown
//!
//! `close()` cancels the worker, unsubscribes the data characteristic and then the
//! status characteristic, and finally disconnects the link. Failures at each step are
//! logged and never abort the teardown. Scans started shortly after a close are not
//! reliable on common radio stacks; the pipeline waits out
//! `notification.settle_delay_ms` before scanning again.

use super::{AdapterOptions, DiscoveredDevice, SessionWorker, Transport, TransportKind};
use crate::error::{AppResult, TelemetryError};
use crate::events::EventSink;
use crate::ingest::{IngestStats, RecordStream};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// GATT service exposed by the device firmware.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Data characteristic (notify): JSON record fragments.
pub const DATA_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Status characteristic (notify): free-form device status text.
pub const STATUS_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a9);

/// Name the firmware advertises.
pub const DEVICE_NAME: &str = "Svartpilen401_OBD2";

/// Default keep-alive period.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(100);

/// Default scan duration.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Radio access: discovery and connection.
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// Discover peripherals for at most `timeout`.
    async fn scan(&self, timeout: Duration) -> AppResult<Vec<DiscoveredDevice>>;

    /// Connect to the peripheral at `address`.
    async fn connect(&self, address: &str) -> AppResult<Box<dyn NotificationLink>>;
}

/// An established connection to one peripheral.
#[async_trait]
pub trait NotificationLink: Send + Sync {
    /// Enable notifications on `characteristic`; payloads arrive on the receiver.
    async fn subscribe(&self, characteristic: Uuid) -> AppResult<mpsc::Receiver<Vec<u8>>>;

    /// Disable notifications on `characteristic`.
    async fn unsubscribe(&self, characteristic: Uuid) -> AppResult<()>;

    /// Drop the connection.
    async fn disconnect(&self) -> AppResult<()>;

    /// Current link state.
    fn is_connected(&self) -> bool;

    /// Watch over the connected flag; it turns `false` when the link is lost.
    fn disconnected(&self) -> watch::Receiver<bool>;
}

/// Whether a scan result looks like the telemetry device.
pub fn is_telemetry_device(device: &DiscoveredDevice, device_name: &str) -> bool {
    device
        .name
        .as_deref()
        .map(|name| name.contains(device_name) || name.contains("OBD2"))
        .unwrap_or(false)
}

/// Run one scan and log what was found, flagging likely telemetry devices.
pub async fn scan_devices(
    backend: &dyn NotificationBackend,
    timeout: Duration,
    device_name: &str,
) -> AppResult<Vec<DiscoveredDevice>> {
    info!(?timeout, "Scanning for devices");
    let devices = backend.scan(timeout).await?;
    for device in &devices {
        if is_telemetry_device(device, device_name) {
            info!(
                name = device.display_name(),
                address = %device.address,
                rssi = ?device.rssi,
                "Found telemetry device"
            );
        } else {
            debug!(name = device.display_name(), address = %device.address, "Found device");
        }
    }
    info!(count = devices.len(), "Scan complete");
    Ok(devices)
}

/// Notification-channel session.
pub struct NotificationTransport {
    backend: Arc<dyn NotificationBackend>,
    address: String,
    keep_alive: Duration,
    options: AdapterOptions,
    link: Option<Arc<dyn NotificationLink>>,
    worker: Option<SessionWorker>,
}

impl NotificationTransport {
    /// Adapter for the peripheral at `address`; nothing is connected yet.
    pub fn new(
        backend: Arc<dyn NotificationBackend>,
        address: impl Into<String>,
        options: AdapterOptions,
    ) -> Self {
        Self {
            backend,
            address: address.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            options,
            link: None,
            worker: None,
        }
    }

    /// Keep-alive period of the worker.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive.max(Duration::from_millis(1));
        self
    }

    async fn release_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        for characteristic in [DATA_CHARACTERISTIC_UUID, STATUS_CHARACTERISTIC_UUID] {
            if let Err(e) = link.unsubscribe(characteristic).await {
                warn!(address = %self.address, %characteristic, error = %e, "Failed to unsubscribe");
            }
        }
        if let Err(e) = link.disconnect().await {
            warn!(address = %self.address, error = %e, "Failed to disconnect");
        }
    }
}

fn connection_failed(address: &str, err: TelemetryError) -> TelemetryError {
    match err {
        TelemetryError::ConnectionFailed { .. } => err,
        other => TelemetryError::ConnectionFailed {
            target: address.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl Transport for NotificationTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Notification
    }

    fn target(&self) -> &str {
        &self.address
    }

    async fn open(&mut self, sink: EventSink) -> AppResult<()> {
        if self.is_open() {
            debug!(address = %self.address, "Notification session already open");
            return Ok(());
        }

        let link: Arc<dyn NotificationLink> = Arc::from(
            self.backend
                .connect(&self.address)
                .await
                .map_err(|e| connection_failed(&self.address, e))?,
        );
        self.link = Some(link.clone());

        let data = match link.subscribe(DATA_CHARACTERISTIC_UUID).await {
            Ok(rx) => rx,
            Err(e) => {
                self.release_link().await;
                return Err(connection_failed(&self.address, e));
            }
        };
        let status = match link.subscribe(STATUS_CHARACTERISTIC_UUID).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(address = %self.address, error = %e, "Status characteristic unavailable");
                None
            }
        };
        info!(address = %self.address, "Connected to notification device");

        let session = NotificationSession {
            address: self.address.clone(),
            link_state: link.disconnected(),
            link,
            data,
            status,
            records: RecordStream::new(self.address.clone(), self.options.ingest),
            sink,
            keep_alive: self.keep_alive,
        };
        self.worker = Some(SessionWorker::spawn(move |cancel| notification_loop(session, cancel)));
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let stopped = match self.worker.take() {
            Some(mut worker) => worker.stop(self.options.shutdown_timeout).await,
            None => Ok(None),
        };
        self.release_link().await;
        if let Ok(Some(stats)) = &stopped {
            info!(address = %self.address, ?stats, "Notification session closed");
        }
        stopped.map(|_| ())
    }

    fn is_open(&self) -> bool {
        self.worker.as_ref().map(SessionWorker::is_running).unwrap_or(false)
    }
}

struct NotificationSession {
    address: String,
    link: Arc<dyn NotificationLink>,
    link_state: watch::Receiver<bool>,
    data: mpsc::Receiver<Vec<u8>>,
    status: Option<mpsc::Receiver<Vec<u8>>>,
    records: RecordStream,
    sink: EventSink,
    keep_alive: Duration,
}

async fn next_status(status: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match status {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn notification_loop(mut session: NotificationSession, cancel: CancellationToken) -> IngestStats {
    let mut keep_alive = tokio::time::interval(session.keep_alive);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'session: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(address = %session.address, "Notification loop cancelled");
                break;
            }
            changed = session.link_state.changed() => {
                if changed.is_err() || !*session.link_state.borrow() {
                    warn!(address = %session.address, "Device disconnected");
                    session.sink.session_lost("Device disconnected");
                    break;
                }
            }
            payload = session.data.recv() => match payload {
                Some(payload) => {
                    for record in session.records.push_datagram(&payload) {
                        if !session.sink.record(record) {
                            break 'session;
                        }
                    }
                }
                None => {
                    warn!(address = %session.address, "Data notifications stopped");
                    session.sink.session_lost("Device disconnected");
                    break;
                }
            },
            status = next_status(&mut session.status) => match status {
                Some(payload) => {
                    debug!(
                        address = %session.address,
                        status = %String::from_utf8_lossy(&payload),
                        "Device status"
                    );
                }
                None => session.status = None,
            },
            _ = keep_alive.tick() => {
                if !session.link.is_connected() {
                    warn!(address = %session.address, "Device no longer connected");
                    session.sink.session_lost("Device disconnected");
                    break;
                }
            }
        }
    }

    session.records.stats()
}
