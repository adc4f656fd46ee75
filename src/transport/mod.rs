//! Transport adapters.
//!
//! A [`Transport`] owns one session against one target: it opens the underlying
//! source, spawns a background worker that pushes records through an
//! [`EventSink`], and tears everything down on [`Transport::close`]. Physical
//! acquisition sits behind backend traits ([`serial::SerialBackend`],
//! [`notification::NotificationBackend`]) so adapters can be driven by the in-memory
//! backends in [`mock`].
//!
//! Three adapters exist:
//!
//! - [`serial::SerialTransport`] - streaming byte connection (serial port)
//! - [`notification::NotificationTransport`] - notification-channel peripheral
//! - [`replay::ReplayTransport`] - timed replay of a recorded file

pub mod mock;
pub mod notification;
pub mod replay;
pub mod serial;

use crate::error::{AppResult, TelemetryError};
use crate::events::EventSink;
use crate::ingest::{IngestOptions, IngestStats};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use notification::{NotificationBackend, NotificationLink};
pub use serial::{NativeSerialBackend, SerialBackend};

/// Which family of adapter a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Streaming byte connection (serial port).
    ByteStream,
    /// Notification channel of a wireless peripheral.
    Notification,
    /// Recorded file replayed on a timer.
    Replay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::ByteStream => "byte-stream",
            TransportKind::Notification => "notification-channel",
            TransportKind::Replay => "file-replay",
        };
        f.write_str(name)
    }
}

/// A connectable target reported by [`crate::pipeline::DataHandler::probe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Identifier passed back in a [`TransportSpec`] (port name, device address).
    pub id: String,
    /// Human-readable description.
    pub description: String,
}

/// A peripheral seen during a notification-channel scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Platform address used to connect.
    pub address: String,
    /// Signal strength in dBm, if reported.
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Advertised name or a placeholder.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Everything needed to open one session, fixed at connect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSpec {
    /// Serial port at a baud rate.
    Serial {
        /// Port name (`/dev/ttyUSB0`, `COM3`).
        port: String,
        /// Line speed.
        baud_rate: u32,
    },
    /// Notification-channel peripheral.
    Notification {
        /// Address from a previous scan.
        address: String,
    },
    /// Recorded file.
    Replay {
        /// JSON or CSV file.
        path: PathBuf,
        /// Playback speed multiplier, finite and > 0.
        speed: f64,
    },
}

impl TransportSpec {
    /// Adapter family for this spec.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportSpec::Serial { .. } => TransportKind::ByteStream,
            TransportSpec::Notification { .. } => TransportKind::Notification,
            TransportSpec::Replay { .. } => TransportKind::Replay,
        }
    }

    /// Target identifier used in status messages.
    pub fn target(&self) -> String {
        match self {
            TransportSpec::Serial { port, .. } => port.clone(),
            TransportSpec::Notification { address } => address.clone(),
            TransportSpec::Replay { path, .. } => path.display().to_string(),
        }
    }
}

/// Settings shared by every adapter.
#[derive(Debug, Clone, Copy)]
pub struct AdapterOptions {
    /// Decoder, timestamp and ordering settings.
    pub ingest: IngestOptions,
    /// How long `close()` waits for the worker before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            ingest: IngestOptions::default(),
            shutdown_timeout: Duration::from_millis(2000),
        }
    }
}

/// Installed acquisition backends.
///
/// A missing backend makes the corresponding transport kind unavailable.
#[derive(Clone)]
pub struct Backends {
    /// Serial port access.
    pub serial: Option<Arc<dyn SerialBackend>>,
    /// Notification-channel radio.
    pub notification: Option<Arc<dyn NotificationBackend>>,
}

impl Backends {
    /// No backends at all. File replay still works.
    pub fn none() -> Self {
        Self {
            serial: None,
            notification: None,
        }
    }

    /// Replace the serial backend.
    pub fn with_serial(mut self, backend: Arc<dyn SerialBackend>) -> Self {
        self.serial = Some(backend);
        self
    }

    /// Replace the notification backend.
    pub fn with_notification(mut self, backend: Arc<dyn NotificationBackend>) -> Self {
        self.notification = Some(backend);
        self
    }

    pub(crate) fn serial(&self) -> AppResult<Arc<dyn SerialBackend>> {
        self.serial
            .clone()
            .ok_or(TelemetryError::BackendUnavailable(TransportKind::ByteStream))
    }

    pub(crate) fn notification(&self) -> AppResult<Arc<dyn NotificationBackend>> {
        self.notification
            .clone()
            .ok_or(TelemetryError::BackendUnavailable(TransportKind::Notification))
    }
}

impl Default for Backends {
    /// Native serial ports; no notification radio.
    fn default() -> Self {
        Self::none().with_serial(Arc::new(NativeSerialBackend))
    }
}

/// One session against one target.
#[async_trait]
pub trait Transport: Send {
    /// Adapter family.
    fn kind(&self) -> TransportKind;

    /// Target identifier.
    fn target(&self) -> &str;

    /// Open the target and start the background worker.
    ///
    /// Returns once the session is live; the worker then pushes through `sink`.
    async fn open(&mut self, sink: EventSink) -> AppResult<()>;

    /// Stop the worker and release the target. Idempotent.
    ///
    /// Waits at most the configured shutdown timeout for the worker, then aborts it
    /// and reports [`TelemetryError::ShutdownTimeout`]. Resources are released
    /// either way.
    async fn close(&mut self) -> AppResult<()>;

    /// Whether the background worker is still running.
    fn is_open(&self) -> bool;
}

/// Background task of an open session, with its cancellation token.
pub(crate) struct SessionWorker {
    cancel: CancellationToken,
    handle: Option<JoinHandle<IngestStats>>,
}

impl SessionWorker {
    /// Spawn `work`, handing it the token it must observe.
    pub(crate) fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = IngestStats> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(work(cancel.clone()));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel and await the worker for at most `timeout`.
    pub(crate) async fn stop(&mut self, timeout: Duration) -> AppResult<Option<IngestStats>> {
        self.cancel.cancel();
        let Some(mut handle) = self.handle.take() else {
            return Ok(None);
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(stats)) => {
                debug!(?stats, "Session worker stopped");
                Ok(Some(stats))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Session worker ended abnormally");
                Ok(None)
            }
            Err(_) => {
                handle.abort();
                warn!(?timeout, "Session worker did not stop in time; aborted");
                Err(TelemetryError::ShutdownTimeout(timeout))
            }
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
