use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const UNKNOWN_FAULT_TEXT: &str = "Unknown error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmKind {
    Alarm,
    Alert,
}

impl AlarmKind {
    pub fn from_feed(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("ALARM") {
            Self::Alarm
        } else {
            Self::Alert
        }
    }

    pub fn sound(self) -> SoundClass {
        match self {
            Self::Alarm => SoundClass::Critical,
            Self::Alert => SoundClass::Advisory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundClass {
    Critical,
    Advisory,
}

impl SoundClass {
    pub fn asset(self) -> &'static str {
        match self {
            Self::Critical => "sound_alarm",
            Self::Advisory => "sound_alert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultCode {
    Numeric(i64),
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRecord {
    pub id: String,
    pub timestamp_epoch: i64,
    pub fault: FaultCode,
    pub kind: AlarmKind,
}

/// Static fault-code lookup, loaded from a JSON asset keyed by fault id or
/// message id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaultTable {
    entries: HashMap<String, String>,
}

impl FaultTable {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, code: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(code.into(), text.into());
    }

    pub fn describe(&self, fault: &FaultCode) -> String {
        match fault {
            FaultCode::Numeric(code) => self
                .entries
                .get(&code.to_string())
                .cloned()
                .unwrap_or_else(|| UNKNOWN_FAULT_TEXT.to_string()),
            FaultCode::Message(message) => {
                if let Some(text) = self.entries.get(message) {
                    return text.clone();
                }
                // BC_SID_LOW_SD_CHECK_BG -> "LOW SD CHECK BG"
                let words: Vec<&str> = message
                    .split('_')
                    .skip(2)
                    .filter(|word| !word.is_empty())
                    .collect();
                if words.is_empty() {
                    UNKNOWN_FAULT_TEXT.to_string()
                } else {
                    words.join(" ")
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmDecision {
    Suppress,
    Show { message: String, sound: SoundClass },
}

#[derive(Debug, Clone)]
pub struct AlarmTracker {
    last_alarm_id: Option<String>,
    active_message: Option<String>,
    window_secs: i64,
}

impl AlarmTracker {
    pub fn new(window_secs: i64) -> Self {
        Self {
            last_alarm_id: None,
            active_message: None,
            window_secs,
        }
    }

    pub fn active_message(&self) -> Option<&str> {
        self.active_message.as_deref()
    }

    pub fn last_alarm_id(&self) -> Option<&str> {
        self.last_alarm_id.as_deref()
    }

    /// Drops whatever message is on screen. Runs at the start of every
    /// successful poll whether or not the feed carries an alarm.
    pub fn clear(&mut self) {
        self.active_message = None;
    }

    pub fn consider(
        &mut self,
        record: &AlarmRecord,
        now_epoch: i64,
        faults: &FaultTable,
    ) -> AlarmDecision {
        self.clear();

        if self.last_alarm_id.as_deref() == Some(record.id.as_str()) {
            return AlarmDecision::Suppress;
        }
        self.last_alarm_id = Some(record.id.clone());

        if now_epoch - record.timestamp_epoch >= self.window_secs {
            return AlarmDecision::Suppress;
        }

        let message = faults.describe(&record.fault);
        self.active_message = Some(message.clone());
        AlarmDecision::Show {
            message,
            sound: record.kind.sound(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn record(id: &str, age_secs: i64, kind: AlarmKind) -> AlarmRecord {
        AlarmRecord {
            id: id.to_string(),
            timestamp_epoch: NOW - age_secs,
            fault: FaultCode::Message("BC_SID_LOW_SD_CHECK_BG".to_string()),
            kind,
        }
    }

    #[test]
    fn same_alarm_is_shown_once() {
        let mut tracker = AlarmTracker::new(900);
        let faults = FaultTable::default();
        let alarm = record("7", 60, AlarmKind::Alarm);

        assert_eq!(
            tracker.consider(&alarm, NOW, &faults),
            AlarmDecision::Show {
                message: "LOW SD CHECK BG".to_string(),
                sound: SoundClass::Critical,
            }
        );
        assert_eq!(tracker.active_message(), Some("LOW SD CHECK BG"));

        assert_eq!(
            tracker.consider(&alarm, NOW + 60, &faults),
            AlarmDecision::Suppress
        );
        assert_eq!(tracker.active_message(), None);
    }

    #[test]
    fn stale_alarm_is_recorded_but_not_shown() {
        let mut tracker = AlarmTracker::new(900);
        let faults = FaultTable::default();

        let stale = record("8", 15 * 60 + 1, AlarmKind::Alert);
        assert_eq!(tracker.consider(&stale, NOW, &faults), AlarmDecision::Suppress);
        assert_eq!(tracker.last_alarm_id(), Some("8"));

        let fresh = record("9", 15 * 60 - 1, AlarmKind::Alert);
        assert!(matches!(
            tracker.consider(&fresh, NOW, &faults),
            AlarmDecision::Show {
                sound: SoundClass::Advisory,
                ..
            }
        ));
    }

    #[test]
    fn fault_table_resolves_codes() {
        let faults = FaultTable::from_json(br#"{"816": "Insulin flow blocked"}"#).unwrap();

        assert_eq!(
            faults.describe(&FaultCode::Numeric(816)),
            "Insulin flow blocked"
        );
        assert_eq!(faults.describe(&FaultCode::Numeric(1)), UNKNOWN_FAULT_TEXT);
        assert_eq!(
            faults.describe(&FaultCode::Message("SHORT".to_string())),
            UNKNOWN_FAULT_TEXT
        );
    }

    #[test]
    fn fault_table_prefers_verbatim_message_entries() {
        let mut faults = FaultTable::default();
        faults.insert("BC_SID_LOW_SD_CHECK_BG", "Low glucose, check BG");

        assert_eq!(
            faults.describe(&FaultCode::Message("BC_SID_LOW_SD_CHECK_BG".to_string())),
            "Low glucose, check BG"
        );
        assert_eq!(
            faults.describe(&FaultCode::Message("BC_SID_HIGH_SG".to_string())),
            "HIGH SG"
        );
    }

    #[test]
    fn alarm_kind_selects_sound() {
        assert_eq!(AlarmKind::from_feed("ALARM").sound(), SoundClass::Critical);
        assert_eq!(AlarmKind::from_feed("ALERT").sound(), SoundClass::Advisory);
        assert_eq!(AlarmKind::from_feed("NOTIFICATION").sound(), SoundClass::Advisory);
    }
}
