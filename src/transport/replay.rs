//! File replay adapter.
//!
//! Loads a recorded drive up front and replays it one record per
//! `base_interval / speed`, the first record immediately, looping back to the first
//! record forever. Timing uses `tokio::time`, so tests can drive it with a paused
//! clock.
//!
//! Accepted formats:
//!
//! - JSON array of wire objects
//! - a single JSON object
//! - CSV with wire-key headers (feature `replay_csv`)
//!
//! The format is chosen by file extension, then by sniffing the first non-blank
//! character. Entries that fail to decode or validate are dropped at load time with a
//! warning; a file with no usable entry cannot be opened.

use super::{AdapterOptions, SessionWorker, Transport, TransportKind};
use crate::error::{AppResult, TelemetryError};
use crate::events::EventSink;
use crate::ingest::{IngestStats, RecordStream};
use crate::record::{Record, TimestampUnit, WireRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between records at speed 1.0.
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_millis(1000);

/// Shortest interval a replay will run at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Layout of a replay file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayFormat {
    /// JSON array or single object.
    Json,
    /// Comma-separated rows with a header line.
    Csv,
}

impl ReplayFormat {
    /// Pick the format from the extension, falling back to the content.
    pub fn detect(path: &Path, contents: &str) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => ReplayFormat::Json,
            Some("csv") => ReplayFormat::Csv,
            _ => match contents.trim_start().chars().next() {
                Some('[') | Some('{') => ReplayFormat::Json,
                _ => ReplayFormat::Csv,
            },
        }
    }
}

fn decode_entry(value: Value, unit: TimestampUnit, index: usize, path: &Path) -> Option<Record> {
    let decoded = serde_json::from_value::<WireRecord>(value)
        .map_err(|e| e.to_string())
        .and_then(|wire| Record::from_wire(wire, unit).map_err(|e| e.to_string()));
    match decoded {
        Ok(record) => Some(record),
        Err(reason) => {
            warn!(path = %path.display(), entry = index, %reason, "Skipping invalid replay entry");
            None
        }
    }
}

fn parse_json(contents: &str, unit: TimestampUnit, path: &Path) -> AppResult<Vec<Record>> {
    let entries = match serde_json::from_str::<Value>(contents)? {
        Value::Array(entries) => entries,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(TelemetryError::Replay(format!(
                "Expected a JSON array or object in {}, found {}",
                path.display(),
                json_type(&other)
            )))
        }
    };
    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| decode_entry(value, unit, index, path))
        .collect())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Typed JSON value for one CSV cell; empty cells are treated as missing.
#[cfg(feature = "replay_csv")]
fn cell_value(cell: &str) -> Option<Value> {
    if cell.is_empty() {
        return None;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Some(Value::from(int));
    }
    if let Ok(float) = cell.parse::<f64>() {
        if float.is_finite() {
            return Some(Value::from(float));
        }
    }
    Some(Value::String(cell.to_string()))
}

#[cfg(feature = "replay_csv")]
fn parse_csv(contents: &str, unit: TimestampUnit, path: &Path) -> AppResult<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(contents.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| TelemetryError::Replay(format!("Bad CSV header in {}: {}", path.display(), e)))?
        .clone();

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!(path = %path.display(), entry = index, error = %e, "Skipping unreadable CSV row");
                continue;
            }
        };
        let object: serde_json::Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .filter_map(|(key, cell)| cell_value(cell).map(|value| (key.to_string(), value)))
            .collect();
        if let Some(record) = decode_entry(Value::Object(object), unit, index, path) {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(not(feature = "replay_csv"))]
fn parse_csv(_contents: &str, _unit: TimestampUnit, _path: &Path) -> AppResult<Vec<Record>> {
    Err(TelemetryError::FeatureNotEnabled("replay_csv".to_string()))
}

/// Parse replay file contents into validated records.
pub fn parse_records(path: &Path, contents: &str, unit: TimestampUnit) -> AppResult<Vec<Record>> {
    let records = match ReplayFormat::detect(path, contents) {
        ReplayFormat::Json => parse_json(contents, unit, path)?,
        ReplayFormat::Csv => parse_csv(contents, unit, path)?,
    };
    if records.is_empty() {
        return Err(TelemetryError::Replay(format!(
            "No valid records in {}",
            path.display()
        )));
    }
    Ok(records)
}

/// Read and parse a replay file.
pub async fn load_records(path: &Path, unit: TimestampUnit) -> AppResult<Vec<Record>> {
    let contents = tokio::fs::read_to_string(path).await?;
    parse_records(path, &contents, unit)
}

/// Interval between records for `speed`. Speed must be finite and positive.
pub fn interval_for(base: Duration, speed: f64) -> AppResult<Duration> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(TelemetryError::Replay(format!(
            "Replay speed must be a positive number, got {}",
            speed
        )));
    }
    let nanos = (base.as_nanos() as f64 / speed).round();
    if nanos >= u64::MAX as f64 {
        return Err(TelemetryError::Replay(format!(
            "Replay speed {} is out of range",
            speed
        )));
    }
    Ok(Duration::from_nanos(nanos as u64).max(MIN_INTERVAL))
}

/// One step of a replay: when, which record, and whether it starts a new pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledRecord {
    /// Time since the replay started.
    pub offset: Duration,
    /// Position in the file.
    pub index: usize,
    /// The record.
    pub record: Record,
    /// True when this step wrapped back to the first record.
    pub wrapped: bool,
}

/// Deterministic replay order, independent of any clock.
#[derive(Debug, Clone)]
pub struct ReplaySchedule {
    records: Arc<[Record]>,
    interval: Duration,
}

impl ReplaySchedule {
    /// Schedule over non-empty `records` at `interval`.
    pub fn new(records: Vec<Record>, interval: Duration) -> AppResult<Self> {
        if records.is_empty() {
            return Err(TelemetryError::Replay("Nothing to replay".to_string()));
        }
        Ok(Self {
            records: records.into(),
            interval,
        })
    }

    /// Interval between consecutive records.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Records in one pass.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always false; a schedule holds at least one record.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The endless step sequence.
    pub fn iter(&self) -> impl Iterator<Item = ScheduledRecord> + Send + 'static {
        let records = self.records.clone();
        let interval = self.interval;
        (0u64..).map(move |step| {
            let index = (step % records.len() as u64) as usize;
            ScheduledRecord {
                offset: interval.saturating_mul(u32::try_from(step).unwrap_or(u32::MAX)),
                index,
                record: records[index],
                wrapped: step > 0 && index == 0,
            }
        })
    }
}

/// Replay session.
pub struct ReplayTransport {
    path: PathBuf,
    target: String,
    speed: f64,
    base_interval: Duration,
    timestamp_unit: TimestampUnit,
    options: AdapterOptions,
    worker: Option<SessionWorker>,
}

impl ReplayTransport {
    /// Adapter for `path` at `speed`; nothing is loaded yet.
    pub fn new(path: impl Into<PathBuf>, speed: f64, options: AdapterOptions) -> Self {
        let path = path.into();
        Self {
            target: path.display().to_string(),
            path,
            speed,
            base_interval: DEFAULT_BASE_INTERVAL,
            timestamp_unit: options.ingest.timestamp_unit,
            options,
            worker: None,
        }
    }

    /// Interval at speed 1.0.
    pub fn with_base_interval(mut self, base_interval: Duration) -> Self {
        self.base_interval = base_interval;
        self
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Replay
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn open(&mut self, sink: EventSink) -> AppResult<()> {
        if self.is_open() {
            debug!(path = %self.target, "Replay already running");
            return Ok(());
        }

        let interval = interval_for(self.base_interval, self.speed)?;
        let records = load_records(&self.path, self.timestamp_unit)
            .await
            .map_err(|e| TelemetryError::ConnectionFailed {
                target: self.target.clone(),
                reason: e.to_string(),
            })?;
        let schedule = ReplaySchedule::new(records, interval)?;
        info!(
            path = %self.target,
            records = schedule.len(),
            ?interval,
            "Replay loaded"
        );

        let stream = RecordStream::new(self.target.clone(), self.options.ingest);
        let target = self.target.clone();
        self.worker = Some(SessionWorker::spawn(move |cancel| {
            replay_loop(target, schedule, stream, sink, cancel)
        }));
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        if let Some(stats) = worker.stop(self.options.shutdown_timeout).await? {
            info!(path = %self.target, ?stats, "Replay stopped");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.worker.as_ref().map(SessionWorker::is_running).unwrap_or(false)
    }
}

async fn replay_loop(
    target: String,
    schedule: ReplaySchedule,
    mut stream: RecordStream,
    sink: EventSink,
    cancel: CancellationToken,
) -> IngestStats {
    let mut ticker = tokio::time::interval(schedule.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for step in schedule.iter() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(path = %target, "Replay cancelled");
                break;
            }
            _ = ticker.tick() => {}
        }

        if step.wrapped {
            debug!(path = %target, "Replay looping to first record");
            stream.restart_sequence();
        }
        if let Some(record) = stream.admit(step.record) {
            if !sink.record(record) {
                break;
            }
        }
    }

    stream.stats()
}
