//! Telemetry record data model and validation.
//!
//! A [`Record`] is one validated telemetry sample. The only way to obtain one is
//! `Record::try_from(WireRecord)`, which runs the domain checks, so holding a `Record`
//! proves that every numeric field lies within its documented range.
//!
//! [`WireRecord`] is the permissive serde view of the JSON object (or tabular row) sent
//! by the device:
//!
//! ```json
//! {
//!   "timestamp": 1000, "rpm": 5000, "speed": 80,
//!   "coolant_temp": 90.5, "throttle_position": 30,
//!   "system_state": "CITY",
//!   "wifi_connected": true, "wifi_rssi": -50
//! }
//! ```
//!
//! Missing or `null` keys default to `0` / `false` / `UNKNOWN`, unknown keys are ignored
//! and `coolant_temp` accepts floats, truncated toward zero.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

/// Valid engine speed, revolutions per minute.
pub const RPM_RANGE: RangeInclusive<i64> = 0..=10_000;
/// Valid road speed, km/h.
pub const SPEED_RANGE: RangeInclusive<i64> = 0..=300;
/// Valid coolant temperature, °C.
pub const COOLANT_RANGE: RangeInclusive<i64> = -40..=150;
/// Valid throttle opening, percent.
pub const THROTTLE_RANGE: RangeInclusive<i64> = 0..=100;
/// Valid link signal strength, dBm.
pub const RSSI_RANGE: RangeInclusive<i64> = -100..=0;

/// Vehicle operating state reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    /// State not reported or not yet known.
    #[default]
    Unknown,
    /// Ignition off.
    EngineOff,
    /// Engine running, vehicle stationary.
    Stopped,
    /// Engine idling.
    Idle,
    /// Vehicle accelerating.
    Accelerating,
    /// Device connected, no drive state yet.
    Connected,
    /// Urban driving.
    City,
    /// Highway driving.
    Highway,
    /// Engine cooling down after a ride.
    Cooling,
}

impl SystemState {
    /// Wire representation of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            SystemState::Unknown => "UNKNOWN",
            SystemState::EngineOff => "ENGINE_OFF",
            SystemState::Stopped => "STOPPED",
            SystemState::Idle => "IDLE",
            SystemState::Accelerating => "ACCELERATING",
            SystemState::Connected => "CONNECTED",
            SystemState::City => "CITY",
            SystemState::Highway => "HIGHWAY",
            SystemState::Cooling => "COOLING",
        }
    }
}

impl FromStr for SystemState {
    type Err = FrameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "UNKNOWN" => Ok(SystemState::Unknown),
            "ENGINE_OFF" => Ok(SystemState::EngineOff),
            "STOPPED" => Ok(SystemState::Stopped),
            "IDLE" => Ok(SystemState::Idle),
            "ACCELERATING" => Ok(SystemState::Accelerating),
            "CONNECTED" => Ok(SystemState::Connected),
            "CITY" => Ok(SystemState::City),
            "HIGHWAY" => Ok(SystemState::Highway),
            "COOLING" => Ok(SystemState::Cooling),
            other => Err(FrameError::UnknownState(other.to_string())),
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numeric field outside its documented domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} = {value} outside {min}..={max}")]
pub struct ValidationError {
    /// Wire key of the offending field.
    pub field: &'static str,
    /// Received value.
    pub value: i64,
    /// Inclusive lower bound.
    pub min: i64,
    /// Inclusive upper bound.
    pub max: i64,
}

/// Why a single frame was dropped.
///
/// These are local to the ingest stage: they are logged and counted, never forwarded to
/// subscribers.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Candidate was not a JSON object of the expected shape.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// `system_state` carried a value outside the enumeration.
    #[error("unknown system_state '{0}'")]
    UnknownState(String),

    /// Boolean field carried something that is not a boolean.
    #[error("invalid boolean '{0}'")]
    InvalidFlag(String),

    /// Decoded but out of domain.
    #[error("invalid record: {0}")]
    Validation(#[from] ValidationError),
}

impl FrameError {
    /// True for domain failures, false for decode failures.
    pub fn is_validation(&self) -> bool {
        matches!(self, FrameError::Validation(_))
    }
}

/// Integer or float on the wire; floats are truncated toward zero.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    fn truncate(self) -> i64 {
        match self {
            Numeric::Int(v) => v,
            // `as` saturates and maps NaN to 0.
            Numeric::Float(v) => v.trunc() as i64,
        }
    }
}

/// Boolean on the wire, also accepting the textual forms found in tabular files.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
    Text(String),
}

fn truncated<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Numeric>::deserialize(deserializer)?.map(Numeric::truncate))
}

/// Permissive view of one wire object, before validation.
///
/// Field names follow the device's JSON keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireRecord {
    /// Device timestamp in the transport's unit.
    pub timestamp: Option<i64>,
    /// Engine RPM.
    pub rpm: Option<i64>,
    /// Speed in km/h.
    pub speed: Option<i64>,
    /// Coolant temperature in °C.
    #[serde(deserialize_with = "truncated")]
    pub coolant_temp: Option<i64>,
    /// Throttle opening in percent.
    pub throttle_position: Option<i64>,
    /// System state string.
    pub system_state: Option<String>,
    /// Link (Wi-Fi) association.
    #[serde(deserialize_with = "flag")]
    pub wifi_connected: Option<FlagValue>,
    /// Link signal strength in dBm.
    pub wifi_rssi: Option<i64>,
}

/// Raw boolean as received, resolved during record construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    /// Proper JSON boolean.
    Bool(bool),
    /// Anything else, resolved case-insensitively.
    Text(String),
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Bool(value)
    }
}

impl FlagValue {
    fn resolve(&self) -> Result<bool, FrameError> {
        match self {
            FlagValue::Bool(b) => Ok(*b),
            FlagValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" | "" => Ok(false),
                _ => Err(FrameError::InvalidFlag(text.clone())),
            },
        }
    }
}

fn flag<'de, D>(deserializer: D) -> Result<Option<FlagValue>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Flag>::deserialize(deserializer)?.map(|raw| match raw {
        Flag::Bool(b) => FlagValue::Bool(b),
        Flag::Int(i) => FlagValue::Bool(i != 0),
        Flag::Text(s) => FlagValue::Text(s),
    }))
}

impl WireRecord {
    /// Parse one JSON frame candidate.
    pub fn from_json(candidate: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(candidate)?)
    }
}

fn check(field: &'static str, value: i64, range: &RangeInclusive<i64>) -> Result<i64, ValidationError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

/// Check every numeric field of a wire object against its domain.
///
/// Missing fields are checked with their default (`0`), which is inside every domain.
pub fn validate(wire: &WireRecord) -> Result<(), ValidationError> {
    check("rpm", wire.rpm.unwrap_or(0), &RPM_RANGE)?;
    check("speed", wire.speed.unwrap_or(0), &SPEED_RANGE)?;
    check("coolant_temp", wire.coolant_temp.unwrap_or(0), &COOLANT_RANGE)?;
    check("throttle_position", wire.throttle_position.unwrap_or(0), &THROTTLE_RANGE)?;
    check("wifi_rssi", wire.wifi_rssi.unwrap_or(0), &RSSI_RANGE)?;
    Ok(())
}

/// One validated telemetry sample.
///
/// Immutable once built. The timestamp is in milliseconds (see [`TimestampUnit`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record {
    timestamp_ms: i64,
    engine_rpm: u16,
    speed_kph: u16,
    coolant_temp_c: i16,
    throttle_pct: u8,
    system_state: SystemState,
    link_connected: bool,
    link_signal_dbm: i8,
}

impl Record {
    /// Device timestamp in milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Engine speed, 0–10000 rpm.
    pub fn engine_rpm(&self) -> u16 {
        self.engine_rpm
    }

    /// Road speed, 0–300 km/h.
    pub fn speed_kph(&self) -> u16 {
        self.speed_kph
    }

    /// Coolant temperature, −40–150 °C.
    pub fn coolant_temp_c(&self) -> i16 {
        self.coolant_temp_c
    }

    /// Throttle opening, 0–100 %.
    pub fn throttle_pct(&self) -> u8 {
        self.throttle_pct
    }

    /// Reported system state.
    pub fn system_state(&self) -> SystemState {
        self.system_state
    }

    /// Whether the device's own uplink is associated.
    pub fn link_connected(&self) -> bool {
        self.link_connected
    }

    /// Uplink signal strength, −100–0 dBm.
    pub fn link_signal_dbm(&self) -> i8 {
        self.link_signal_dbm
    }

    /// Build from a wire object whose timestamp is expressed in `unit`.
    pub fn from_wire(wire: WireRecord, unit: TimestampUnit) -> Result<Self, FrameError> {
        let record = Record::try_from(wire)?;
        Ok(Record {
            timestamp_ms: unit.to_millis(record.timestamp_ms),
            ..record
        })
    }

    /// Parse and validate one JSON frame candidate.
    pub fn from_json(candidate: &str, unit: TimestampUnit) -> Result<Self, FrameError> {
        Record::from_wire(WireRecord::from_json(candidate)?, unit)
    }

    /// Wire view of this record (timestamp in milliseconds).
    pub fn to_wire(&self) -> WireRecord {
        WireRecord {
            timestamp: Some(self.timestamp_ms),
            rpm: Some(i64::from(self.engine_rpm)),
            speed: Some(i64::from(self.speed_kph)),
            coolant_temp: Some(i64::from(self.coolant_temp_c)),
            throttle_position: Some(i64::from(self.throttle_pct)),
            system_state: Some(self.system_state.as_str().to_string()),
            wifi_connected: Some(FlagValue::Bool(self.link_connected)),
            wifi_rssi: Some(i64::from(self.link_signal_dbm)),
        }
    }
}

impl TryFrom<WireRecord> for Record {
    type Error = FrameError;

    /// Timestamp is taken as-is; use [`Record::from_wire`] to convert units.
    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        let system_state = match wire.system_state.as_deref() {
            Some(state) => state.parse()?,
            None => SystemState::Unknown,
        };
        let link_connected = match &wire.wifi_connected {
            Some(flag) => flag.resolve()?,
            None => false,
        };
        validate(&wire)?;

        // Ranges were checked above, so the narrowing casts below cannot truncate.
        Ok(Record {
            timestamp_ms: wire.timestamp.unwrap_or(0),
            engine_rpm: wire.rpm.unwrap_or(0) as u16,
            speed_kph: wire.speed.unwrap_or(0) as u16,
            coolant_temp_c: wire.coolant_temp.unwrap_or(0) as i16,
            throttle_pct: wire.throttle_position.unwrap_or(0) as u8,
            system_state,
            link_connected,
            link_signal_dbm: wire.wifi_rssi.unwrap_or(0) as i8,
        })
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_wire().serialize(serializer)
    }
}

/// Unit of the timestamps a transport delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    /// Already milliseconds.
    #[default]
    Milliseconds,
    /// Seconds, multiplied by 1000.
    Seconds,
}

impl TimestampUnit {
    /// Convert a raw timestamp into milliseconds.
    pub fn to_millis(self, raw: i64) -> i64 {
        match self {
            TimestampUnit::Milliseconds => raw,
            TimestampUnit::Seconds => raw.saturating_mul(1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{"rpm": 5000, "speed": 80, "coolant_temp": 90, "throttle_position": 30,
        "system_state": "CITY", "wifi_connected": true, "wifi_rssi": -50, "timestamp": 1000}"#;

    #[test]
    fn parses_full_frame() {
        let record = Record::from_json(FULL, TimestampUnit::Milliseconds).unwrap();
        assert_eq!(record.timestamp_ms(), 1000);
        assert_eq!(record.engine_rpm(), 5000);
        assert_eq!(record.speed_kph(), 80);
        assert_eq!(record.coolant_temp_c(), 90);
        assert_eq!(record.throttle_pct(), 30);
        assert_eq!(record.system_state(), SystemState::City);
        assert!(record.link_connected());
        assert_eq!(record.link_signal_dbm(), -50);
    }

    #[test]
    fn missing_keys_take_defaults() {
        let record = Record::from_json("{}", TimestampUnit::Milliseconds).unwrap();
        assert_eq!(record.timestamp_ms(), 0);
        assert_eq!(record.engine_rpm(), 0);
        assert_eq!(record.system_state(), SystemState::Unknown);
        assert!(!record.link_connected());
    }

    #[test]
    fn null_and_unknown_keys_are_tolerated() {
        let record = Record::from_json(
            r#"{"rpm": null, "gear": 3, "system_state": null, "speed": 12}"#,
            TimestampUnit::Milliseconds,
        )
        .unwrap();
        assert_eq!(record.engine_rpm(), 0);
        assert_eq!(record.speed_kph(), 12);
        assert_eq!(record.system_state(), SystemState::Unknown);
    }

    #[test]
    fn coolant_float_is_truncated() {
        let record =
            Record::from_json(r#"{"coolant_temp": 89.9}"#, TimestampUnit::Milliseconds).unwrap();
        assert_eq!(record.coolant_temp_c(), 89);

        let record =
            Record::from_json(r#"{"coolant_temp": -39.7}"#, TimestampUnit::Milliseconds).unwrap();
        assert_eq!(record.coolant_temp_c(), -39);
    }

    #[test]
    fn out_of_domain_rpm_is_a_validation_failure() {
        let err = Record::from_json(r#"{"rpm": 99999}"#, TimestampUnit::Milliseconds).unwrap_err();
        assert!(err.is_validation());
        match err {
            FrameError::Validation(v) => {
                assert_eq!(v.field, "rpm");
                assert_eq!(v.value, 99999);
                assert_eq!(v.max, 10_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_state_is_a_decode_failure() {
        let err = Record::from_json(r#"{"system_state": "PARKED"}"#, TimestampUnit::Milliseconds)
            .unwrap_err();
        assert!(matches!(err, FrameError::UnknownState(ref s) if s == "PARKED"));
        assert!(!err.is_validation());
    }

    #[test]
    fn malformed_json_is_a_decode_failure() {
        let err = Record::from_json(r#"{"rpm": }"#, TimestampUnit::Milliseconds).unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
    }

    #[test]
    fn textual_flags_resolve() {
        let on = Record::from_json(r#"{"wifi_connected": "True"}"#, TimestampUnit::Milliseconds)
            .unwrap();
        assert!(on.link_connected());
        let off = Record::from_json(r#"{"wifi_connected": 0}"#, TimestampUnit::Milliseconds).unwrap();
        assert!(!off.link_connected());
        assert!(matches!(
            Record::from_json(r#"{"wifi_connected": "maybe"}"#, TimestampUnit::Milliseconds),
            Err(FrameError::InvalidFlag(_))
        ));
    }

    #[test]
    fn seconds_are_converted_to_millis() {
        let record = Record::from_json(r#"{"timestamp": 1700000000}"#, TimestampUnit::Seconds)
            .unwrap();
        assert_eq!(record.timestamp_ms(), 1_700_000_000_000);
        assert_eq!(TimestampUnit::Seconds.to_millis(i64::MAX), i64::MAX);
    }

    #[test]
    fn serializes_with_wire_keys() {
        let record = Record::from_json(FULL, TimestampUnit::Milliseconds).unwrap();
        let value = serde_json::to_value(record).unwrap();
        assert_eq!(value["rpm"], 5000);
        assert_eq!(value["system_state"], "CITY");
        assert_eq!(value["wifi_connected"], true);
        assert_eq!(value["coolant_temp"], 90);
    }

    #[test]
    fn every_state_parses_from_its_wire_name() {
        for state in [
            SystemState::Unknown,
            SystemState::EngineOff,
            SystemState::Stopped,
            SystemState::Idle,
            SystemState::Accelerating,
            SystemState::Connected,
            SystemState::City,
            SystemState::Highway,
            SystemState::Cooling,
        ] {
            assert_eq!(state.as_str().parse::<SystemState>().unwrap(), state);
        }
    }
}
