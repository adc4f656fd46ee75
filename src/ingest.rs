//! Ingest stage: frames → validated, ordered records.
//!
//! [`RecordStream`] is what every adapter feeds. It owns one [`FrameDecoder`], parses
//! each candidate, validates it, converts the timestamp to milliseconds and tracks
//! per-session ordering. Malformed frames and invalid records are logged and counted
//! here and never travel further. Out-of-order and duplicate records are only dropped
//! when `reject_out_of_order` is set; otherwise a timestamp regression (device reset)
//! restarts the sequence and the record is delivered.

use crate::framing::{FrameDecoder, FramingStrategy};
use crate::record::{FrameError, Record, TimestampUnit};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Counters kept by a [`RecordStream`] over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Candidates extracted by the frame decoder.
    pub frames: u64,
    /// Records handed to the caller.
    pub records: u64,
    /// Candidates that did not decode (category c).
    pub decode_errors: u64,
    /// Decoded records outside their domain (category d).
    pub validation_failures: u64,
    /// Records older than their predecessor (dropped only with the guard on).
    pub out_of_order: u64,
    /// Exact repeats of the previous record (dropped only with the guard on).
    pub duplicates: u64,
    /// Times the decoder buffer was discarded for exceeding its cap.
    pub buffer_overflows: u64,
}

/// Options for building a [`RecordStream`].
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Frame matching policy.
    pub strategy: FramingStrategy,
    /// Decoder buffer cap in bytes.
    pub max_buffer_bytes: usize,
    /// Unit of incoming timestamps.
    pub timestamp_unit: TimestampUnit,
    /// Drop records older than (or identical to) their predecessor. Off by default.
    pub reject_out_of_order: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            strategy: FramingStrategy::Brace,
            max_buffer_bytes: crate::framing::DEFAULT_MAX_BUFFER_BYTES,
            timestamp_unit: TimestampUnit::Milliseconds,
            reject_out_of_order: false,
        }
    }
}

/// Why a record does not follow its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderViolation {
    OutOfOrder,
    Duplicate,
}

/// Per-session monotonic timestamp guard.
#[derive(Debug, Default)]
struct SequenceGuard {
    last: Option<Record>,
}

impl SequenceGuard {
    fn admit(&mut self, record: Record) -> Result<(), OrderViolation> {
        if let Some(last) = self.last {
            if record.timestamp_ms() < last.timestamp_ms() {
                return Err(OrderViolation::OutOfOrder);
            }
            // A zero timestamp means the device did not send one; identical samples
            // are legitimate then.
            if record.timestamp_ms() != 0 && record == last {
                return Err(OrderViolation::Duplicate);
            }
        }
        self.last = Some(record);
        Ok(())
    }

    /// Take `record` as the new predecessor regardless of order.
    fn restart_from(&mut self, record: Record) {
        self.last = Some(record);
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Frame decoder plus record construction, validation and ordering.
pub struct RecordStream {
    decoder: Box<dyn FrameDecoder>,
    timestamp_unit: TimestampUnit,
    reject_out_of_order: bool,
    guard: SequenceGuard,
    stats: IngestStats,
    source: String,
}

impl RecordStream {
    /// Stream for `source` (used in log lines) with the given options.
    pub fn new(source: impl Into<String>, options: IngestOptions) -> Self {
        Self {
            decoder: options.strategy.build(options.max_buffer_bytes),
            timestamp_unit: options.timestamp_unit,
            reject_out_of_order: options.reject_out_of_order,
            guard: SequenceGuard::default(),
            stats: IngestStats::default(),
            source: source.into(),
        }
    }

    /// Stream using a caller-provided decoder.
    pub fn with_decoder(
        source: impl Into<String>,
        decoder: Box<dyn FrameDecoder>,
        options: IngestOptions,
    ) -> Self {
        Self {
            decoder,
            ..Self::new(source, options)
        }
    }

    /// Feed a raw chunk; returns the valid records it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Record> {
        let overflows_before = self.decoder.overflows();
        let candidates = self.decoder.feed(chunk);
        self.stats.buffer_overflows += self.decoder.overflows() - overflows_before;

        let mut records = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            self.stats.frames += 1;
            match Record::from_json(&candidate, self.timestamp_unit) {
                Ok(record) => {
                    if let Some(record) = self.admit(record) {
                        records.push(record);
                    }
                }
                Err(err) => self.reject(&candidate, err),
            }
        }
        records
    }

    /// Decode one self-contained payload.
    ///
    /// Like [`RecordStream::push`], but nothing is carried over: a partial object left
    /// at the end of `payload` is discarded so it cannot pair with the next payload.
    pub fn push_datagram(&mut self, payload: &[u8]) -> Vec<Record> {
        let records = self.push(payload);
        let leftover = self.decoder.buffered_len();
        if leftover > 0 {
            self.stats.decode_errors += 1;
            debug!(source = %self.source, bytes = leftover, "Discarding incomplete payload");
            self.decoder.reset();
        }
        records
    }

    /// Run an already-decoded record through the ordering check.
    ///
    /// Used by sources that do not go through the frame decoder (file replay).
    pub fn admit(&mut self, record: Record) -> Option<Record> {
        let Err(violation) = self.guard.admit(record) else {
            self.stats.records += 1;
            return Some(record);
        };

        match violation {
            OrderViolation::OutOfOrder => self.stats.out_of_order += 1,
            OrderViolation::Duplicate => self.stats.duplicates += 1,
        }
        if self.reject_out_of_order {
            match violation {
                OrderViolation::OutOfOrder => warn!(
                    source = %self.source,
                    timestamp = record.timestamp_ms(),
                    "Dropping out-of-order record"
                ),
                OrderViolation::Duplicate => debug!(
                    source = %self.source,
                    timestamp = record.timestamp_ms(),
                    "Dropping duplicate record"
                ),
            }
            return None;
        }

        if violation == OrderViolation::OutOfOrder {
            info!(
                source = %self.source,
                timestamp = record.timestamp_ms(),
                "Timestamp went backwards; restarting sequence"
            );
        }
        self.guard.restart_from(record);
        self.stats.records += 1;
        Some(record)
    }

    fn reject(&mut self, candidate: &str, err: FrameError) {
        if err.is_validation() {
            self.stats.validation_failures += 1;
            warn!(source = %self.source, frame = candidate, "Invalid data received: {}", err);
        } else {
            self.stats.decode_errors += 1;
            warn!(source = %self.source, frame = candidate, "Failed to parse frame: {}", err);
        }
    }

    /// Forget the ordering history (new session, replay wrap-around).
    pub fn restart_sequence(&mut self) {
        self.guard.reset();
    }

    /// Drop buffered bytes and ordering history.
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.guard.reset();
    }

    /// Counters so far.
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Bytes retained by the decoder.
    pub fn buffered_len(&self) -> usize {
        self.decoder.buffered_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn frame(ts: i64, rpm: i64) -> String {
        format!(r#"{{"timestamp": {ts}, "rpm": {rpm}, "speed": 10}}"#)
    }

    #[test]
    fn valid_frames_become_records() {
        let mut stream = RecordStream::new("test", IngestOptions::default());
        let records = stream.push(format!("{}{}", frame(1, 800), frame(2, 900)).as_bytes());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].engine_rpm(), 800);
        assert_eq!(records[1].engine_rpm(), 900);
        assert_eq!(stats_records(&stream), 2);
    }

    fn stats_records(stream: &RecordStream) -> u64 {
        stream.stats().records
    }

    #[traced_test]
    #[test]
    fn invalid_record_is_dropped_and_logged() {
        let mut stream = RecordStream::new("test", IngestOptions::default());
        let input = format!("{}{}{}", frame(1, 800), frame(2, 99_999), frame(3, 900));
        let records = stream.push(input.as_bytes());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].timestamp_ms(), 3);
        assert_eq!(stream.stats().validation_failures, 1);
        assert!(logs_contain("Invalid data received"));
    }

    #[traced_test]
    #[test]
    fn malformed_frame_is_dropped_and_stream_continues() {
        let mut stream = RecordStream::new("test", IngestOptions::default());
        let records = stream.push(format!("{{\"rpm\": 12,,}}{}", frame(5, 1000)).as_bytes());
        assert_eq!(records.len(), 1);
        assert_eq!(stream.stats().decode_errors, 1);
        assert!(logs_contain("Failed to parse frame"));
    }

    fn guarded() -> IngestOptions {
        IngestOptions {
            reject_out_of_order: true,
            ..IngestOptions::default()
        }
    }

    #[test]
    fn out_of_order_and_duplicates_are_dropped() {
        let mut stream = RecordStream::new("test", guarded());
        let input = format!("{}{}{}{}", frame(10, 800), frame(5, 800), frame(10, 800), frame(10, 850));
        let records = stream.push(input.as_bytes());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].engine_rpm(), 850);
        let stats = stream.stats();
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn identical_records_without_timestamp_are_kept() {
        let mut stream = RecordStream::new("test", guarded());
        let records = stream.push(br#"{"rpm": 900}{"rpm": 900}"#);
        assert_eq!(records.len(), 2);
    }

    #[traced_test]
    #[test]
    fn device_reset_restarts_sequence_by_default() {
        let mut stream = RecordStream::new("test", IngestOptions::default());
        let input = format!(
            "{}{}{}{}",
            frame(600_000, 800),
            frame(50, 800),
            frame(150, 800),
            frame(150, 800)
        );
        let timestamps: Vec<i64> = stream
            .push(input.as_bytes())
            .iter()
            .map(|r| r.timestamp_ms())
            .collect();
        assert_eq!(timestamps, vec![600_000, 50, 150, 150]);
        assert_eq!(stream.stats().out_of_order, 1);
        assert_eq!(stream.stats().duplicates, 1);
        assert!(logs_contain("Timestamp went backwards"));
    }

    #[test]
    fn restart_sequence_allows_earlier_timestamps() {
        let mut stream = RecordStream::new("test", guarded());
        assert_eq!(stream.push(frame(10, 800).as_bytes()).len(), 1);
        stream.restart_sequence();
        assert_eq!(stream.push(frame(1, 800).as_bytes()).len(), 1);
    }

    #[test]
    fn timestamps_in_seconds_are_scaled() {
        let options = IngestOptions {
            timestamp_unit: TimestampUnit::Seconds,
            ..IngestOptions::default()
        };
        let mut stream = RecordStream::new("test", options);
        let records = stream.push(frame(3, 800).as_bytes());
        assert_eq!(records[0].timestamp_ms(), 3000);
    }

    #[test]
    fn datagrams_do_not_share_a_buffer() {
        let mut stream = RecordStream::new("test", IngestOptions::default());
        assert!(stream.push_datagram(br#"{"timestamp": 1, "rp"#).is_empty());
        assert_eq!(stream.buffered_len(), 0);
        let records = stream.push_datagram(frame(2, 900).as_bytes());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_ms(), 2);
        assert_eq!(stream.stats().decode_errors, 1);
    }

    #[test]
    fn overflow_is_counted() {
        let options = IngestOptions {
            max_buffer_bytes: 100,
            ..IngestOptions::default()
        };
        let mut stream = RecordStream::new("test", options);
        assert!(stream.push(&[b'{'; 500]).is_empty());
        assert_eq!(stream.stats().buffer_overflows, 1);
        assert_eq!(stream.buffered_len(), 0);
    }
}
