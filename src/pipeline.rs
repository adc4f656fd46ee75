//! The ingestion pipeline.
//!
//! [`DataHandler`] owns at most one live transport session and forwards its records,
//! unmodified and in order, to every subscriber. It is a cheap `Clone` handle; all
//! clones drive the same pipeline.
//!
//! # State machine
//!
//! ```text
//! Idle ──connect──▶ Connecting ──open ok──▶ Connected
//!  ▲                    │                      │
//!  └──── open failed ───┘◀── disconnect / loss ┘
//! Idle ──scan──▶ Scanning ──▶ Idle
//! ```
//!
//! Transitions are serialised by one session lock. Each session is tagged with an
//! epoch; tearing a session down retires its epoch under the distributor lock, so a
//! worker that is still winding down cannot publish anything once `disconnect` or a
//! superseding `connect` returns.
//!
//! # Failure handling
//!
//! - open failure: disconnected status event, back to `Idle`, error returned, no retry
//! - mid-session loss (I/O error, EOF, remote disconnect): error event and
//!   disconnected status from the worker, back to `Idle`, resources released
//! - with `pipeline.auto_reconnect` a lost session is re-established with exponential
//!   backoff until it succeeds, the attempts run out, or the operator issues any
//!   other transition

use crate::backoff::retry_delay;
use crate::config::TelemetryConfig;
use crate::distributor::EventDistributor;
use crate::error::{AppResult, TelemetryError};
use crate::events::{spawn_observer, EventObserver, EventSink, SessionLost, TelemetryEvent};
use crate::transport::notification::{scan_devices, NotificationTransport};
use crate::transport::replay::ReplayTransport;
use crate::transport::serial::SerialTransport;
use crate::transport::{Backends, DiscoveredDevice, Target, Transport, TransportKind, TransportSpec};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Lifecycle state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineState {
    /// No session.
    Idle,
    /// Notification-channel scan in progress.
    Scanning,
    /// A session is being opened.
    Connecting,
    /// A session is live.
    Connected,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Scanning => "scanning",
            PipelineState::Connecting => "connecting",
            PipelineState::Connected => "connected",
        };
        f.write_str(name)
    }
}

struct Session {
    epoch: u64,
    spec: TransportSpec,
    transport: Box<dyn Transport>,
}

struct HandlerInner {
    config: TelemetryConfig,
    backends: Backends,
    /// Held for the whole of every transition.
    session: Mutex<Option<Session>>,
    distributor: Arc<EventDistributor>,
    state: Arc<watch::Sender<PipelineState>>,
    lost_tx: mpsc::UnboundedSender<SessionLost>,
    /// Bumped by every operator-issued transition; pending auto-reconnects compare it.
    transitions: AtomicU64,
    last_spec: parking_lot::Mutex<Option<TransportSpec>>,
    last_notification_close: parking_lot::Mutex<Option<Instant>>,
    discovered: parking_lot::Mutex<Vec<DiscoveredDevice>>,
}

/// Handle to the ingestion pipeline.
#[derive(Clone)]
pub struct DataHandler {
    inner: Arc<HandlerInner>,
}

impl DataHandler {
    /// Pipeline with the given configuration and backends.
    ///
    /// Must be called from within a Tokio runtime: a supervisor task handling
    /// session losses is spawned here.
    pub fn new(config: TelemetryConfig, backends: Backends) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(HandlerInner {
            config,
            backends,
            session: Mutex::new(None),
            distributor: Arc::new(EventDistributor::new()),
            state: Arc::new(state),
            lost_tx,
            transitions: AtomicU64::new(0),
            last_spec: parking_lot::Mutex::new(None),
            last_notification_close: parking_lot::Mutex::new(None),
            discovered: parking_lot::Mutex::new(Vec::new()),
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), lost_rx));
        Self { inner }
    }

    /// Pipeline with default backends (native serial, no notification radio).
    pub fn with_config(config: TelemetryConfig) -> Self {
        Self::new(config, Backends::default())
    }

    /// Open a session for `spec`, superseding any live one.
    ///
    /// Returns once the session is live. On failure a disconnected status event is
    /// published, the pipeline returns to `Idle` and the error is returned.
    #[instrument(skip(self), fields(kind = %spec.kind(), target = %spec.target()))]
    pub async fn connect(&self, spec: TransportSpec) -> AppResult<()> {
        self.inner.transitions.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_spec.lock() = Some(spec.clone());
        self.inner.establish(spec, None).await
    }

    /// Tear down the live session, if any. Idempotent; a no-op when idle.
    pub async fn disconnect(&self) -> AppResult<()> {
        self.inner.transitions.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.inner.session.lock().await;
        self.inner.teardown(&mut slot).await;
        Ok(())
    }

    /// Connect again with the most recent [`TransportSpec`].
    pub async fn reconnect(&self) -> AppResult<()> {
        let spec = self
            .inner
            .last_spec
            .lock()
            .clone()
            .ok_or(TelemetryError::NothingToReconnect)?;
        self.connect(spec).await
    }

    /// Discover notification-channel peripherals.
    ///
    /// Only allowed from `Idle`. If a notification session was closed less than
    /// `notification.settle_delay_ms` ago, waits out the remainder first. Results
    /// are cached for [`DataHandler::probe`] and published as
    /// [`TelemetryEvent::DevicesDiscovered`].
    pub async fn scan(&self, kind: TransportKind, timeout: Duration) -> AppResult<Vec<DiscoveredDevice>> {
        if kind != TransportKind::Notification {
            return Err(TelemetryError::Unsupported(format!("scanning is not available for {}", kind)));
        }
        let backend = self.inner.backends.notification()?;

        let mut slot = self.inner.session.lock().await;
        let state = self.state();
        if state != PipelineState::Idle {
            return Err(TelemetryError::Busy(state));
        }
        // Only a scan that actually runs supersedes a pending reconnect.
        self.inner.transitions.fetch_add(1, Ordering::SeqCst);
        // A session that ended on its own is still holding its resources.
        self.inner.teardown(&mut slot).await;
        self.inner.wait_for_radio().await;

        self.inner.state.send_replace(PipelineState::Scanning);
        let result = scan_devices(
            backend.as_ref(),
            timeout,
            &self.inner.config.notification.device_name,
        )
        .await;
        self.inner.state.send_replace(PipelineState::Idle);
        drop(slot);

        let devices = result?;
        *self.inner.discovered.lock() = devices.clone();
        self.inner
            .distributor
            .publish(TelemetryEvent::DevicesDiscovered(devices.clone()));
        Ok(devices)
    }

    /// Scan with the configured timeout.
    pub async fn scan_default(&self) -> AppResult<Vec<DiscoveredDevice>> {
        let timeout = Duration::from_secs(self.inner.config.notification.scan_timeout_secs);
        self.scan(TransportKind::Notification, timeout).await
    }

    /// Targets that can currently be connected for `kind`.
    ///
    /// Serial ports are enumerated live; notification targets come from the last
    /// scan; replay has no discoverable targets.
    pub fn probe(&self, kind: TransportKind) -> AppResult<Vec<Target>> {
        match kind {
            TransportKind::ByteStream => self.inner.backends.serial()?.available_ports(),
            TransportKind::Notification => Ok(self
                .inner
                .discovered
                .lock()
                .iter()
                .map(|device| Target {
                    id: device.address.clone(),
                    description: match device.rssi {
                        Some(rssi) => format!("{} ({} dBm)", device.display_name(), rssi),
                        None => device.display_name().to_string(),
                    },
                })
                .collect()),
            TransportKind::Replay => Ok(Vec::new()),
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TelemetryEvent> {
        self.inner.distributor.subscribe()
    }

    /// Drive `observer` with every event published from now on.
    ///
    /// The task ends, returning the observer, when the pipeline is dropped.
    pub fn attach<O: EventObserver>(&self, observer: O) -> JoinHandle<O> {
        spawn_observer(observer, self.subscribe())
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        *self.inner.state.borrow()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.inner.state.subscribe()
    }

    /// Spec of the live session, if any.
    pub async fn current_spec(&self) -> Option<TransportSpec> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.spec.clone())
    }

    /// Configuration in use.
    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }
}

impl HandlerInner {
    fn set_state(&self, state: PipelineState) {
        self.state.send_replace(state);
    }

    fn build(&self, spec: &TransportSpec) -> AppResult<Box<dyn Transport>> {
        let config = &self.config;
        let transport: Box<dyn Transport> = match spec {
            TransportSpec::Serial { port, baud_rate } => Box::new(
                SerialTransport::new(self.backends.serial()?, port.clone(), *baud_rate, config.serial_options())
                    .with_read_chunk_bytes(config.serial.read_chunk_bytes),
            ),
            TransportSpec::Notification { address } => Box::new(
                NotificationTransport::new(
                    self.backends.notification()?,
                    address.clone(),
                    config.notification_options(),
                )
                .with_keep_alive(Duration::from_millis(config.notification.keep_alive_ms)),
            ),
            TransportSpec::Replay { path, speed } => Box::new(
                ReplayTransport::new(path.clone(), *speed, config.replay_options())
                    .with_base_interval(Duration::from_millis(config.replay.base_interval_ms)),
            ),
        };
        Ok(transport)
    }

    /// Open a session for `spec`. With `guard`, gives up if an operator transition
    /// happened since the guard was taken.
    async fn establish(&self, spec: TransportSpec, guard: Option<u64>) -> AppResult<()> {
        let mut slot = self.session.lock().await;
        if let Some(expected) = guard {
            if self.transitions.load(Ordering::SeqCst) != expected {
                return Err(TelemetryError::Busy(*self.state.borrow()));
            }
        }

        self.teardown(&mut slot).await;

        let epoch = self.distributor.advance_epoch();
        let target = spec.target();
        self.set_state(PipelineState::Connecting);
        info!(kind = %spec.kind(), %target, "Connecting");

        let mut transport = match self.build(&spec) {
            Ok(transport) => transport,
            Err(e) => return Err(self.open_failed(&target, e)),
        };
        let sink = EventSink::new(
            epoch,
            self.distributor.clone(),
            self.state.clone(),
            self.lost_tx.clone(),
        );
        if let Err(e) = transport.open(sink).await {
            // Nothing may be left running behind a failed open.
            if let Err(close_err) = transport.close().await {
                debug!(error = %close_err, "Close after failed open");
            }
            return Err(self.open_failed(&target, e));
        }

        // The worker may already have lost the session; then it stays Idle.
        let state = &self.state;
        let announced = self.distributor.transact(epoch, |tx| {
            if *state.borrow() == PipelineState::Connecting {
                tx.send(TelemetryEvent::Status {
                    connected: true,
                    message: format!("Connected to {}", target),
                });
                state.send_replace(PipelineState::Connected);
                true
            } else {
                false
            }
        });
        if announced == Some(true) {
            info!(%target, "Connected");
        }
        *slot = Some(Session {
            epoch,
            spec,
            transport,
        });
        Ok(())
    }

    fn open_failed(&self, target: &str, err: TelemetryError) -> TelemetryError {
        let reason = match &err {
            TelemetryError::ConnectionFailed { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        warn!(%target, %reason, "Failed to connect");
        self.distributor.publish(TelemetryEvent::Status {
            connected: false,
            message: format!("Failed to connect to {}: {}", target, reason),
        });
        self.set_state(PipelineState::Idle);
        err
    }

    /// Retire and close the session in `slot`, if any.
    ///
    /// Publishes a disconnected status unless the session already reported its own
    /// loss. The caller must hold the session lock.
    async fn teardown(&self, slot: &mut Option<Session>) {
        let Some(mut session) = slot.take() else {
            return;
        };

        let state = &self.state;
        let already_lost = self
            .distributor
            .transact(session.epoch, |tx| {
                tx.advance_epoch();
                *state.borrow() == PipelineState::Idle
            })
            .unwrap_or(true);

        if let Err(e) = session.transport.close().await {
            warn!(target = session.transport.target(), error = %e, "Session did not close cleanly");
        }
        if session.spec.kind() == TransportKind::Notification {
            *self.last_notification_close.lock() = Some(Instant::now());
        }

        if !already_lost {
            info!(target = session.transport.target(), "Disconnected");
            self.distributor.publish(TelemetryEvent::Status {
                connected: false,
                message: "Disconnected".to_string(),
            });
        }
        self.set_state(PipelineState::Idle);
    }

    /// Wait until a scan after the last notification close is reliable.
    async fn wait_for_radio(&self) {
        let settle = Duration::from_millis(self.config.notification.settle_delay_ms);
        let closed = *self.last_notification_close.lock();
        if let Some(closed) = closed {
            let ready = closed + settle;
            if Instant::now() < ready {
                debug!(remaining = ?(ready - Instant::now()), "Waiting for radio to settle");
                tokio::time::sleep_until(ready).await;
            }
        }
    }

    async fn handle_loss(&self, notice: SessionLost) {
        let (spec, guard) = {
            let mut slot = self.session.lock().await;
            match slot.as_ref() {
                Some(session) if session.epoch == notice.epoch => {}
                _ => return,
            }
            info!(reason = %notice.reason, "Session lost");
            let spec = slot.as_ref().map(|session| session.spec.clone());
            self.teardown(&mut slot).await;
            (spec, self.transitions.load(Ordering::SeqCst))
        };

        if let (true, Some(spec)) = (self.config.pipeline.auto_reconnect, spec) {
            self.auto_reconnect(spec, guard).await;
        }
    }

    async fn auto_reconnect(&self, spec: TransportSpec, guard: u64) {
        let attempts = self.config.pipeline.max_reconnect_attempts;
        let max_delay = Duration::from_millis(self.config.pipeline.reconnect_max_delay_ms);

        for attempt in 1..=attempts {
            tokio::time::sleep(retry_delay(attempt, max_delay)).await;
            if self.transitions.load(Ordering::SeqCst) != guard {
                debug!("Operator took over; abandoning reconnect");
                return;
            }
            info!(attempt, max = attempts, target = %spec.target(), "Reconnecting");
            match self.establish(spec.clone(), Some(guard)).await {
                Ok(()) => return,
                Err(TelemetryError::Busy(_)) => return,
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        warn!(attempts, "Giving up on reconnect");
        self.distributor.publish(TelemetryEvent::Error(format!(
            "Reconnect to {} failed after {} attempts",
            spec.target(),
            attempts
        )));
    }
}

async fn supervise(inner: Weak<HandlerInner>, mut lost: mpsc::UnboundedReceiver<SessionLost>) {
    while let Some(notice) = lost.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_loss(notice).await;
    }
    debug!("Pipeline supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockNotificationBackend, MockSerialBackend};
    use tokio::io::AsyncWriteExt;

    fn serial(port: &str) -> TransportSpec {
        TransportSpec::Serial {
            port: port.to_string(),
            baud_rate: 115_200,
        }
    }

    fn handler_with_ports(ports: &[&str]) -> (DataHandler, Vec<tokio::io::DuplexStream>) {
        let backend = Arc::new(MockSerialBackend::new());
        let devices = ports.iter().map(|port| backend.add_port(port)).collect();
        let handler = DataHandler::new(TelemetryConfig::default(), Backends::none().with_serial(backend));
        (handler, devices)
    }

    #[tokio::test]
    async fn connect_and_disconnect_publish_status() {
        let (handler, _devices) = handler_with_ports(&["/dev/ttyA"]);
        let mut events = handler.subscribe();

        handler.connect(serial("/dev/ttyA")).await.unwrap();
        assert_eq!(handler.state(), PipelineState::Connected);
        assert_eq!(
            events.recv().await,
            Some(TelemetryEvent::Status {
                connected: true,
                message: "Connected to /dev/ttyA".into()
            })
        );

        handler.disconnect().await.unwrap();
        assert_eq!(handler.state(), PipelineState::Idle);
        assert_eq!(
            events.recv().await,
            Some(TelemetryEvent::Status {
                connected: false,
                message: "Disconnected".into()
            })
        );

        // Idempotent and silent when idle.
        handler.disconnect().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_failure_returns_to_idle() {
        let (handler, _devices) = handler_with_ports(&[]);
        let mut events = handler.subscribe();

        let err = handler.connect(serial("/dev/ttyMISSING")).await.unwrap_err();
        assert!(matches!(err, TelemetryError::ConnectionFailed { .. }));
        assert_eq!(handler.state(), PipelineState::Idle);
        match events.recv().await {
            Some(TelemetryEvent::Status { connected, message }) => {
                assert!(!connected);
                assert!(message.starts_with("Failed to connect to /dev/ttyMISSING"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn records_are_forwarded_in_order() {
        let (handler, mut devices) = handler_with_ports(&["/dev/ttyA"]);
        let mut events = handler.subscribe();
        handler.connect(serial("/dev/ttyA")).await.unwrap();
        let _ = events.recv().await; // connected

        let device = &mut devices[0];
        for ts in 1..=20 {
            device
                .write_all(format!(r#"{{"timestamp": {}, "rpm": 1000}}"#, ts).as_bytes())
                .await
                .unwrap();
        }
        for ts in 1..=20 {
            let event = events.recv().await.unwrap();
            assert_eq!(event.as_record().unwrap().timestamp_ms(), ts);
        }
        handler.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn scan_is_rejected_for_other_kinds_and_when_busy() {
        let notification = Arc::new(MockNotificationBackend::new());
        let serial_backend = Arc::new(MockSerialBackend::new());
        let _device = serial_backend.add_port("/dev/ttyA");
        let handler = DataHandler::new(
            TelemetryConfig::default(),
            Backends::none()
                .with_serial(serial_backend)
                .with_notification(notification),
        );

        assert!(matches!(
            handler.scan(TransportKind::ByteStream, Duration::from_secs(1)).await,
            Err(TelemetryError::Unsupported(_))
        ));

        handler.connect(serial("/dev/ttyA")).await.unwrap();
        let transitions = handler.inner.transitions.load(Ordering::SeqCst);
        assert!(matches!(
            handler.scan(TransportKind::Notification, Duration::from_secs(1)).await,
            Err(TelemetryError::Busy(PipelineState::Connected))
        ));
        // A refused scan does not count as an operator transition.
        assert_eq!(handler.inner.transitions.load(Ordering::SeqCst), transitions);
        handler.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn scan_without_backend_is_unavailable() {
        let handler = DataHandler::new(TelemetryConfig::default(), Backends::none());
        assert!(matches!(
            handler.scan(TransportKind::Notification, Duration::from_secs(1)).await,
            Err(TelemetryError::BackendUnavailable(TransportKind::Notification))
        ));
        assert!(matches!(
            handler.probe(TransportKind::ByteStream),
            Err(TelemetryError::BackendUnavailable(TransportKind::ByteStream))
        ));
        assert!(handler.probe(TransportKind::Replay).unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconnect_needs_a_previous_session() {
        let (handler, _devices) = handler_with_ports(&[]);
        assert!(matches!(
            handler.reconnect().await,
            Err(TelemetryError::NothingToReconnect)
        ));
    }

    #[test]
    fn state_names() {
        assert_eq!(PipelineState::Connecting.to_string(), "connecting");
        assert_eq!(PipelineState::Idle.to_string(), "idle");
    }
}
