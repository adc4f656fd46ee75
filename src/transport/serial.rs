//! Streaming byte connection adapter (serial port).
//!
//! The adapter opens a [`ByteStream`] through its [`SerialBackend`] and runs one read
//! loop per session. Every chunk goes through the session's [`RecordStream`] and the
//! records it completes are emitted immediately, in decode order. The loop awaits
//! readiness on the stream and observes cancellation at once.
//!
//! End-of-file or a read error while running ends the session: an error event and a
//! disconnected status are published and the worker exits. The adapter never
//! restarts itself.

use super::{AdapterOptions, SessionWorker, Target, Transport, TransportKind};
use crate::error::{AppResult, TelemetryError};
use crate::events::EventSink;
use crate::ingest::{IngestStats, RecordStream};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default line speed of the device firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default read chunk size.
pub const DEFAULT_READ_CHUNK_BYTES: usize = 1024;

/// An open byte stream.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Access to serial ports.
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// Ports currently present on the host.
    fn available_ports(&self) -> AppResult<Vec<Target>>;

    /// Open `port` at `baud_rate`.
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<ByteStream>;
}

/// Host serial ports through `tokio-serial`.
///
/// Without the `tokio_serial` feature every call fails with
/// [`TelemetryError::SerialFeatureDisabled`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSerialBackend;

#[cfg(feature = "tokio_serial")]
fn describe(port_type: &tokio_serial::SerialPortType) -> String {
    use tokio_serial::SerialPortType;
    match port_type {
        SerialPortType::UsbPort(usb) => match (&usb.manufacturer, &usb.product) {
            (Some(manufacturer), Some(product)) => format!("{} {}", manufacturer, product),
            (None, Some(product)) => product.clone(),
            _ => format!("USB {:04x}:{:04x}", usb.vid, usb.pid),
        },
        SerialPortType::PciPort => "PCI serial port".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        SerialPortType::Unknown => "Serial port".to_string(),
    }
}

#[async_trait]
impl SerialBackend for NativeSerialBackend {
    #[cfg(feature = "tokio_serial")]
    fn available_ports(&self) -> AppResult<Vec<Target>> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| TelemetryError::Io(std::io::Error::other(e.to_string())))?;
        Ok(ports
            .into_iter()
            .map(|info| Target {
                description: describe(&info.port_type),
                id: info.port_name,
            })
            .collect())
    }

    #[cfg(not(feature = "tokio_serial"))]
    fn available_ports(&self) -> AppResult<Vec<Target>> {
        Err(TelemetryError::SerialFeatureDisabled)
    }

    #[cfg(feature = "tokio_serial")]
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<ByteStream> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TelemetryError::ConnectionFailed {
                target: port.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "tokio_serial"))]
    async fn open(&self, _port: &str, _baud_rate: u32) -> AppResult<ByteStream> {
        Err(TelemetryError::SerialFeatureDisabled)
    }
}

/// Serial-port session.
pub struct SerialTransport {
    backend: Arc<dyn SerialBackend>,
    port: String,
    baud_rate: u32,
    read_chunk_bytes: usize,
    options: AdapterOptions,
    worker: Option<SessionWorker>,
}

impl SerialTransport {
    /// Adapter for `port` at `baud_rate`; nothing is opened yet.
    pub fn new(
        backend: Arc<dyn SerialBackend>,
        port: impl Into<String>,
        baud_rate: u32,
        options: AdapterOptions,
    ) -> Self {
        Self {
            backend,
            port: port.into(),
            baud_rate,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            options,
            worker: None,
        }
    }

    /// Size of the buffer handed to each read.
    pub fn with_read_chunk_bytes(mut self, bytes: usize) -> Self {
        self.read_chunk_bytes = bytes.max(1);
        self
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ByteStream
    }

    fn target(&self) -> &str {
        &self.port
    }

    async fn open(&mut self, sink: EventSink) -> AppResult<()> {
        if self.is_open() {
            debug!(port = %self.port, "Serial session already open");
            return Ok(());
        }

        let stream = self.backend.open(&self.port, self.baud_rate).await?;
        info!(port = %self.port, baud_rate = self.baud_rate, "Serial port opened");

        let records = RecordStream::new(self.port.clone(), self.options.ingest);
        let chunk = self.read_chunk_bytes;
        let port = self.port.clone();
        self.worker = Some(SessionWorker::spawn(move |cancel| {
            read_loop(port, stream, records, sink, cancel, chunk)
        }));
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        // Dropping the stream inside the worker releases the port.
        let stats = worker.stop(self.options.shutdown_timeout).await?;
        if let Some(stats) = stats {
            info!(port = %self.port, ?stats, "Serial port closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.worker.as_ref().map(SessionWorker::is_running).unwrap_or(false)
    }
}

async fn read_loop(
    port: String,
    mut stream: ByteStream,
    mut records: RecordStream,
    sink: EventSink,
    cancel: CancellationToken,
    chunk: usize,
) -> IngestStats {
    let mut buf = vec![0u8; chunk];

    'session: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(port = %port, "Serial read loop cancelled");
                break;
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    warn!(port = %port, "Serial port reached end of stream");
                    sink.session_lost(TelemetryError::SerialUnexpectedEof.to_string());
                    break;
                }
                Ok(n) => {
                    for record in records.push(&buf[..n]) {
                        if !sink.record(record) {
                            debug!(port = %port, "Session superseded; stopping read loop");
                            break 'session;
                        }
                    }
                }
                Err(e) => {
                    error!(port = %port, error = %e, "Serial read error");
                    sink.session_lost(format!("Serial read error: {}", e));
                    break;
                }
            }
        }
    }

    records.stats()
}
