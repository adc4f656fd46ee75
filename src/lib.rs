//! # Telemetry Ingest
//!
//! Transport-agnostic ingestion of vehicle telemetry. A remote device streams JSON
//! objects (engine RPM, speed, coolant temperature, throttle, system state, uplink
//! status) over a serial line or a wireless notification channel, or a recorded drive
//! is replayed from a file. This crate recovers discrete records from the chunked
//! stream, validates them, and delivers them in arrival order to any number of
//! subscribers.
//!
//! ## Crate Structure
//!
//! - **`record`**: The `Record` value type, its permissive wire view and domain
//!   validation. Holding a `Record` proves it is valid.
//! - **`framing`**: `FrameDecoder` implementations that turn a chunked byte stream into
//!   JSON-object candidates.
//! - **`ingest`**: `RecordStream`, which couples a decoder with parsing, validation,
//!   timestamp conversion and per-session ordering checks.
//! - **`transport`**: The `Transport` trait and the serial, notification-channel and
//!   file-replay adapters, plus in-memory backends in `transport::mock`.
//! - **`pipeline`**: `DataHandler`, the single entry point: connect, disconnect, scan,
//!   probe, subscribe.
//! - **`events`** / **`distributor`**: Events delivered to consumers and their fan-out.
//! - **`config`**: Figment-based configuration (`config/telemetry.toml` plus
//!   `TELEMETRY_` environment overrides).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: The crate-wide `TelemetryError` and `AppResult`.
//!
//! ## Example
//!
//! ```no_run
//! use telemetry_ingest::config::TelemetryConfig;
//! use telemetry_ingest::events::TelemetryEvent;
//! use telemetry_ingest::pipeline::DataHandler;
//! use telemetry_ingest::transport::TransportSpec;
//!
//! # async fn run() -> telemetry_ingest::error::AppResult<()> {
//! let handler = DataHandler::with_config(TelemetryConfig::load()?);
//! let mut events = handler.subscribe();
//! handler
//!     .connect(TransportSpec::Replay { path: "drive.json".into(), speed: 2.0 })
//!     .await?;
//! while let Some(event) = events.recv().await {
//!     if let TelemetryEvent::Record(record) = event {
//!         println!("{} rpm", record.engine_rpm());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod distributor;
pub mod error;
pub mod events;
pub mod framing;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod record;
pub mod transport;

pub use error::{AppResult, TelemetryError};
pub use events::{EventObserver, TelemetryEvent};
pub use pipeline::{DataHandler, PipelineState};
pub use record::Record;
pub use transport::{TransportKind, TransportSpec};
