//! Events delivered to the presentation boundary.
//!
//! Subscribers receive [`TelemetryEvent`]s through an `mpsc` receiver
//! ([`crate::pipeline::DataHandler::subscribe`]) or implement [`EventObserver`] and let
//! [`crate::pipeline::DataHandler::attach`] drive it. Records and status changes are
//! separate events, delivered in the order they were produced.

use crate::distributor::EventDistributor;
use crate::pipeline::PipelineState;
use crate::record::Record;
use crate::transport::DiscoveredDevice;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// One event on the pipeline's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// A validated record from the live session.
    Record(Record),
    /// Connection status changed.
    Status {
        /// Whether a session is now live.
        connected: bool,
        /// Human-readable description ("Connected to /dev/ttyUSB0", ...).
        message: String,
    },
    /// A surfaced failure (mid-session I/O, remote disconnect).
    Error(String),
    /// Result of a notification-channel scan.
    DevicesDiscovered(Vec<DiscoveredDevice>),
}

impl TelemetryEvent {
    /// The record carried by this event, if any.
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            TelemetryEvent::Record(record) => Some(record),
            _ => None,
        }
    }
}

/// Notice sent to the pipeline when a session ends on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLost {
    /// Epoch of the session that ended.
    pub epoch: u64,
    /// What ended it.
    pub reason: String,
}

/// Push interface handed to a transport when it is opened.
///
/// Every publish is tagged with the epoch of the session the sink was created for.
/// Once the pipeline supersedes that session the sink goes quiet: publishes are
/// dropped and report `false`, which workers take as a signal to stop.
#[derive(Clone)]
pub struct EventSink {
    epoch: u64,
    distributor: Arc<EventDistributor>,
    state: Arc<watch::Sender<PipelineState>>,
    lost: mpsc::UnboundedSender<SessionLost>,
}

impl EventSink {
    pub(crate) fn new(
        epoch: u64,
        distributor: Arc<EventDistributor>,
        state: Arc<watch::Sender<PipelineState>>,
        lost: mpsc::UnboundedSender<SessionLost>,
    ) -> Self {
        Self {
            epoch,
            distributor,
            state,
            lost,
        }
    }

    /// Sink that is not attached to a pipeline, for driving a transport directly.
    ///
    /// Returns the event receiver and the receiver of session-lost notices.
    pub fn detached() -> (
        Self,
        mpsc::UnboundedReceiver<TelemetryEvent>,
        mpsc::UnboundedReceiver<SessionLost>,
    ) {
        let distributor = Arc::new(EventDistributor::new());
        let events = distributor.subscribe();
        let (state, _) = watch::channel(PipelineState::Connected);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let sink = Self::new(distributor.current_epoch(), distributor, Arc::new(state), lost_tx);
        (sink, events, lost_rx)
    }

    /// Epoch of the session this sink belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the session is still the live one.
    pub fn is_current(&self) -> bool {
        self.distributor.is_current(self.epoch)
    }

    /// Forward a validated record. Returns false once the session is superseded.
    pub fn record(&self, record: Record) -> bool {
        self.distributor
            .publish_from(self.epoch, TelemetryEvent::Record(record))
    }

    /// Report a connection status change.
    pub fn status(&self, connected: bool, message: impl Into<String>) -> bool {
        self.distributor.publish_from(
            self.epoch,
            TelemetryEvent::Status {
                connected,
                message: message.into(),
            },
        )
    }

    /// Report a failure that does not end the session.
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.distributor
            .publish_from(self.epoch, TelemetryEvent::Error(message.into()))
    }

    /// The session ended on its own (I/O failure, EOF, remote disconnect).
    ///
    /// Publishes the error and a disconnected status, moves the pipeline to `Idle`
    /// and notifies it, all atomically with respect to a concurrent disconnect. Does
    /// nothing if the session was already superseded.
    pub fn session_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let published = self.distributor.transact(self.epoch, |tx| {
            tx.send(TelemetryEvent::Error(reason.clone()));
            tx.send(TelemetryEvent::Status {
                connected: false,
                message: format!("Disconnected: {}", reason),
            });
            self.state.send_replace(PipelineState::Idle);
        });
        if published.is_some() {
            let _ = self.lost.send(SessionLost {
                epoch: self.epoch,
                reason,
            });
        } else {
            debug!(epoch = self.epoch, %reason, "Ignoring loss of superseded session");
        }
    }
}

/// Callback-style consumer of pipeline events.
///
/// All methods default to no-ops so observers only implement what they display.
pub trait EventObserver: Send + 'static {
    /// A validated record arrived.
    fn on_record(&mut self, _record: &Record) {}

    /// Connection status changed.
    fn on_status(&mut self, _connected: bool, _message: &str) {}

    /// A session failed.
    fn on_error(&mut self, _message: &str) {}

    /// A scan completed.
    fn on_devices_discovered(&mut self, _devices: &[DiscoveredDevice]) {}
}

/// Route one event to the matching observer method.
pub fn dispatch(observer: &mut dyn EventObserver, event: &TelemetryEvent) {
    match event {
        TelemetryEvent::Record(record) => observer.on_record(record),
        TelemetryEvent::Status { connected, message } => observer.on_status(*connected, message),
        TelemetryEvent::Error(message) => observer.on_error(message),
        TelemetryEvent::DevicesDiscovered(devices) => observer.on_devices_discovered(devices),
    }
}

/// Drive `observer` from `events` until the channel closes.
pub fn spawn_observer<O: EventObserver>(
    mut observer: O,
    mut events: mpsc::UnboundedReceiver<TelemetryEvent>,
) -> JoinHandle<O> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            dispatch(&mut observer, &event);
        }
        observer
    })
}
