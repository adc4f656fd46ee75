//! Custom error types for the pipeline.
//!
//! This module defines the primary error type, `TelemetryError`, for everything that
//! crosses a component boundary: configuration, transport lifecycle, replay loading and
//! pipeline state transitions. Using the `thiserror` crate, it provides a centralized
//! and consistent way to handle the failures of the ingestion pipeline.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in `config/telemetry.toml` or `TELEMETRY_` environment overrides.
//! - **`Configuration`**: Semantic errors that pass parsing but are logically wrong
//!   (e.g. a replay speed of zero). Caught during `TelemetryConfig::validate`.
//! - **`Io`**: Wraps `std::io::Error`, covering file access and transport I/O.
//! - **`ConnectionFailed`**: A transport could not be opened (category (a) failures).
//! - **`FeatureNotEnabled`** / **`SerialFeatureDisabled`**: functionality that was not
//!   compiled in. The message tells the user which feature flag to enable.
//!
//! Frame-level failures (malformed JSON, out-of-domain values) are deliberately *not*
//! part of this enum: they live in [`crate::record::FrameError`] and never leave the
//! ingest stage.

use crate::pipeline::PipelineState;
use crate::transport::TransportKind;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type AppResult<T> = std::result::Result<T, TelemetryError>;

/// Errors surfaced by transports, configuration and the pipeline.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON that had to parse (replay files) did not.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A transport target could not be opened.
    #[error("Failed to connect to {target}: {reason}")]
    ConnectionFailed {
        /// Port name, device address or file path.
        target: String,
        /// Backend-provided reason.
        reason: String,
    },

    /// The byte stream reached end-of-file while the session was running.
    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    /// Native serial support was not compiled in.
    #[error("Serial support not enabled. Rebuild with --features tokio_serial")]
    SerialFeatureDisabled,

    /// No backend is installed for the requested transport kind.
    #[error("No {0} backend available")]
    BackendUnavailable(TransportKind),

    /// The operation does not apply to the requested transport kind.
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// The pipeline is in a state that does not allow the operation.
    #[error("Pipeline is busy ({0})")]
    Busy(PipelineState),

    /// Notification link failure (subscribe, unsubscribe, disconnect).
    #[error("Notification link error: {0}")]
    Notification(String),

    /// Replay source could not be turned into a record sequence.
    #[error("Replay error: {0}")]
    Replay(String),

    /// `reconnect()` was called before any session was ever requested.
    #[error("No previous session to reconnect")]
    NothingToReconnect,

    /// A session worker did not stop within its grace period.
    #[error("Worker did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    /// Feature compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for TelemetryError {
    fn from(value: figment::Error) -> Self {
        TelemetryError::Config(Box::new(value))
    }
}

impl TelemetryError {
    /// Whether the operator can reasonably retry the operation that failed.
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            TelemetryError::Io(_)
                | TelemetryError::ConnectionFailed { .. }
                | TelemetryError::SerialUnexpectedEof
                | TelemetryError::Busy(_)
                | TelemetryError::Notification(_)
                | TelemetryError::ShutdownTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failure_names_target() {
        let err = TelemetryError::ConnectionFailed {
            target: "/dev/ttyUSB0".into(),
            reason: "device busy".into(),
        };
        let message = err.to_string();
        assert!(message.contains("/dev/ttyUSB0"));
        assert!(message.contains("device busy"));
        assert!(err.can_recover());
    }

    #[test]
    fn feature_errors_are_not_recoverable() {
        assert!(!TelemetryError::SerialFeatureDisabled.can_recover());
        assert!(!TelemetryError::FeatureNotEnabled("replay_csv".into()).can_recover());
        assert!(!TelemetryError::Configuration("speed".into()).can_recover());
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn open() -> AppResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        match open() {
            Err(TelemetryError::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
