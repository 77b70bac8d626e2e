use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::alarm::{AlarmKind, AlarmRecord, FaultCode};

pub const LAST_UPDATE: &str = "lastConduitUpdateServerDateTime";
pub const TIME_ZONE_NAME: &str = "clientTimeZoneName";
pub const LAST_ALARM: &str = "lastAlarm";
pub const CONDUIT_IN_RANGE: &str = "conduitInRange";
pub const DEVICE_IN_RANGE: &str = "conduitMedicalDeviceInRange";
pub const SENSOR_IN_RANGE: &str = "conduitSensorInRange";
pub const BATTERY_PERCENT: &str = "pumpBatteryLevelPercent";
pub const RESERVOIR_UNITS: &str = "reservoirRemainingUnits";
pub const SENSOR_HOURS: &str = "sensorDurationHours";
pub const SENSOR_STATE: &str = "sensorState";
pub const CALIBRATION_STATUS: &str = "calibStatus";
pub const CALIBRATION_FREE: &str = "calFreeSensor";
pub const HOURS_TO_CALIBRATION: &str = "timeToNextCalibHours";
pub const SHIELD_STATE: &str = "therapyAlgorithmState.autoModeShieldState";
pub const SG_TREND: &str = "lastSGTrend";
pub const LAST_SG: &str = "lastSG.sg";
pub const ACTIVE_INSULIN: &str = "activeInsulin.amount";
pub const SYSTEM_STATUS: &str = "systemStatusMessage";
pub const BANNER_TYPE: &str = "pumpBannerState.0.type";
pub const ABOVE_RANGE: &str = "aboveHyperLimit";
pub const IN_RANGE: &str = "timeInRange";
pub const BELOW_RANGE: &str = "belowHypoLimit";
pub const AVERAGE_SG: &str = "averageSG";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("telemetry body is empty")]
    Empty,
    #[error("telemetry body is not valid JSON: {0}")]
    Malformed(String),
    #[error("telemetry body is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("field `{0}` is missing")]
    Missing(String),
    #[error("field `{path}` is not {expected}")]
    WrongType { path: String, expected: &'static str },
    #[error("field `{path}` has unusable value {value:?}")]
    Invalid { path: String, value: String },
}

impl FieldError {
    pub fn path(&self) -> &str {
        match self {
            Self::Missing(path) => path,
            Self::WrongType { path, .. } | Self::Invalid { path, .. } => path,
        }
    }
}

/// One poll cycle's worth of telemetry. Fields are only reachable through the
/// typed accessors below, each of which reports its own failure.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    root: Map<String, Value>,
}

impl DeviceSnapshot {
    pub fn from_slice(body: &[u8]) -> Result<Self, SnapshotError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(SnapshotError::Empty);
        }
        let value: Value = serde_json::from_slice(body)
            .map_err(|err| SnapshotError::Malformed(err.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, SnapshotError> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            Value::String(text) if text.is_empty() => Err(SnapshotError::Empty),
            _ => Err(SnapshotError::NotAnObject),
        }
    }

    /// Walks a dotted path; numeric segments index into arrays.
    pub fn field(&self, path: &str) -> Result<&Value, FieldError> {
        let mut segments = path.split('.');
        let first = segments.next().unwrap_or_default();
        let mut current = self
            .root
            .get(first)
            .ok_or_else(|| FieldError::Missing(path.to_string()))?;

        for segment in segments {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| FieldError::Missing(path.to_string()))?;
        }

        if current.is_null() {
            return Err(FieldError::Missing(path.to_string()));
        }
        Ok(current)
    }

    pub fn bool(&self, path: &str) -> Result<bool, FieldError> {
        self.field(path)?
            .as_bool()
            .ok_or_else(|| wrong_type(path, "a boolean"))
    }

    pub fn i64(&self, path: &str) -> Result<i64, FieldError> {
        let value = self.field(path)?;
        if let Some(number) = value.as_i64() {
            return Ok(number);
        }
        match value.as_f64() {
            Some(number) if number.fract() == 0.0 => Ok(number as i64),
            _ => Err(wrong_type(path, "an integer")),
        }
    }

    pub fn f64(&self, path: &str) -> Result<f64, FieldError> {
        self.field(path)?
            .as_f64()
            .ok_or_else(|| wrong_type(path, "a number"))
    }

    pub fn str(&self, path: &str) -> Result<&str, FieldError> {
        self.field(path)?
            .as_str()
            .ok_or_else(|| wrong_type(path, "a string"))
    }

    /// Time-zone name reported by the feed; used for the DST heuristic.
    pub fn time_zone_name(&self) -> Result<&str, FieldError> {
        self.str(TIME_ZONE_NAME)
    }

    pub fn last_update_epoch_ms(&self) -> Result<i64, FieldError> {
        self.i64(LAST_UPDATE)
    }

    /// Extracts the most recent alarm. Offset-less timestamps are read in
    /// `local_offset`, the configured zone plus the current DST delta.
    pub fn last_alarm(&self, local_offset: FixedOffset) -> Result<AlarmRecord, FieldError> {
        let alarm = self.field(LAST_ALARM)?;
        if !alarm.is_object() {
            return Err(wrong_type(LAST_ALARM, "an object"));
        }

        let id = ["GUID", "instanceId"]
            .iter()
            .find_map(|key| match alarm.get(*key) {
                Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                _ => None,
            })
            .ok_or_else(|| FieldError::Missing(format!("{LAST_ALARM}.instanceId")))?;

        let raw_time = ["dateTime", "datetime"]
            .iter()
            .find_map(|key| alarm.get(*key).and_then(Value::as_str))
            .ok_or_else(|| FieldError::Missing(format!("{LAST_ALARM}.datetime")))?;
        // An unreadable timestamp counts as long past so the id is still
        // recorded and the alarm stays silent.
        let timestamp_epoch = parse_alarm_time(raw_time, local_offset).unwrap_or(0);

        let fault = if let Some(code) = alarm.get("faultId").and_then(Value::as_i64) {
            FaultCode::Numeric(code)
        } else if let Some(message) = alarm.get("messageId").and_then(Value::as_str) {
            FaultCode::Message(message.to_string())
        } else {
            return Err(FieldError::Missing(format!("{LAST_ALARM}.messageId")));
        };

        let kind = ["type", "kind"]
            .iter()
            .find_map(|key| alarm.get(*key).and_then(Value::as_str))
            .map(AlarmKind::from_feed)
            .unwrap_or(AlarmKind::Alert);

        Ok(AlarmRecord {
            id,
            timestamp_epoch,
            fault,
            kind,
        })
    }
}

fn wrong_type(path: &str, expected: &'static str) -> FieldError {
    FieldError::WrongType {
        path: path.to_string(),
        expected,
    }
}

/// The feed writes `yyyy-mm-ddThh:mm:ss.000-00:00`; `-00:00` carries no real
/// offset, so those and offset-less strings are read as local time.
fn parse_alarm_time(raw: &str, local_offset: FixedOffset) -> Option<i64> {
    let raw = raw.trim();
    if !raw.ends_with("-00:00") {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.timestamp());
        }
    }

    let prefix = raw.get(..19)?;
    let naive = NaiveDateTime::parse_from_str(prefix, "%Y-%m-%dT%H:%M:%S").ok()?;
    local_offset
        .from_local_datetime(&naive)
        .single()
        .map(|time| time.timestamp())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn snapshot(value: Value) -> DeviceSnapshot {
        DeviceSnapshot::from_value(value).unwrap()
    }

    #[test]
    fn rejects_empty_and_non_object_bodies() {
        assert_eq!(DeviceSnapshot::from_slice(b"  "), Err(SnapshotError::Empty));
        assert_eq!(DeviceSnapshot::from_slice(b"\"\""), Err(SnapshotError::Empty));
        assert_eq!(
            DeviceSnapshot::from_slice(b"[1, 2]"),
            Err(SnapshotError::NotAnObject)
        );
        assert!(matches!(
            DeviceSnapshot::from_slice(b"{\"broken\""),
            Err(SnapshotError::Malformed(_))
        ));
    }

    #[test]
    fn walks_nested_paths_and_arrays() {
        let snap = snapshot(json!({
            "therapyAlgorithmState": { "autoModeShieldState": "AUTO_BASAL" },
            "pumpBannerState": [{ "type": "TEMP_BASAL" }],
            "lastSG": { "sg": 132 },
        }));

        assert_eq!(snap.str(SHIELD_STATE).unwrap(), "AUTO_BASAL");
        assert_eq!(snap.str(BANNER_TYPE).unwrap(), "TEMP_BASAL");
        assert_eq!(snap.i64(LAST_SG).unwrap(), 132);
    }

    #[test]
    fn reports_missing_null_and_mistyped_fields() {
        let snap = snapshot(json!({
            "conduitInRange": "yes",
            "sensorState": null,
            "pumpBannerState": [],
        }));

        assert_eq!(
            snap.bool(CONDUIT_IN_RANGE),
            Err(FieldError::WrongType {
                path: CONDUIT_IN_RANGE.to_string(),
                expected: "a boolean",
            })
        );
        assert_eq!(
            snap.str(SENSOR_STATE),
            Err(FieldError::Missing(SENSOR_STATE.to_string()))
        );
        assert_eq!(snap.str(BANNER_TYPE).unwrap_err().path(), BANNER_TYPE);
    }

    #[test]
    fn integers_accept_whole_floats_only() {
        let snap = snapshot(json!({ "a": 12.0, "b": 12.5 }));

        assert_eq!(snap.i64("a").unwrap(), 12);
        assert!(snap.i64("b").is_err());
        assert_eq!(snap.f64("b").unwrap(), 12.5);
    }

    #[test]
    fn reads_legacy_alarm_format_in_local_time() {
        let snap = snapshot(json!({
            "lastAlarm": {
                "instanceId": 4711,
                "datetime": "2024-03-01T10:00:00.000-00:00",
                "messageId": "BC_SID_LOW_SD_CHECK_BG",
                "kind": "ALARM",
            }
        }));
        let offset = FixedOffset::east_opt(3600).unwrap();

        let alarm = snap.last_alarm(offset).unwrap();

        assert_eq!(alarm.id, "4711");
        assert_eq!(alarm.timestamp_epoch, 1_709_283_600);
        assert_eq!(
            alarm.fault,
            FaultCode::Message("BC_SID_LOW_SD_CHECK_BG".to_string())
        );
        assert_eq!(alarm.kind, AlarmKind::Alarm);
    }

    #[test]
    fn reads_current_alarm_format() {
        let snap = snapshot(json!({
            "lastAlarm": {
                "GUID": "a1b2",
                "dateTime": "2024-03-01T10:00:00.000Z",
                "faultId": 816,
                "type": "ALERT",
            }
        }));

        let alarm = snap.last_alarm(FixedOffset::east_opt(0).unwrap()).unwrap();

        assert_eq!(alarm.id, "a1b2");
        assert_eq!(alarm.timestamp_epoch, 1_709_287_200);
        assert_eq!(alarm.fault, FaultCode::Numeric(816));
        assert_eq!(alarm.kind, AlarmKind::Alert);
    }

    #[test]
    fn unreadable_alarm_time_reads_as_epoch_start() {
        let snap = snapshot(json!({
            "lastAlarm": { "GUID": "g-7", "datetime": "yesterday-ish", "faultId": 3 }
        }));

        let alarm = snap.last_alarm(FixedOffset::east_opt(0).unwrap()).unwrap();

        assert_eq!(alarm.id, "g-7");
        assert_eq!(alarm.timestamp_epoch, 0);
    }

    #[test]
    fn alarm_without_id_is_a_field_failure() {
        let snap = snapshot(json!({
            "lastAlarm": { "datetime": "2024-03-01T10:00:00", "messageId": "X" }
        }));

        let err = snap.last_alarm(FixedOffset::east_opt(0).unwrap()).unwrap_err();

        assert!(matches!(err, FieldError::Missing(_)));
    }
}
