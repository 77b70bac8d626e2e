use std::fmt;

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use serde::Serialize;
use thiserror::Error;

pub const CLOCK_PLACEHOLDER: &str = "--:--";
pub const NO_UPDATE_LABEL: &str = "---";
pub const SYNCING_NOTICE: &str = "Trying to synch time and date ...";

const STALE_AFTER_MINUTES: u32 = 15;
const DST_MARKERS: [&str; 2] = ["summer", "daylight"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("time server `{server}` could not be resolved: {reason}")]
    Resolve { server: String, reason: String },
    #[error("time server did not answer: {0}")]
    Network(String),
    #[error("time sync did not complete within {after_ms} ms")]
    Timeout { after_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocalTime {
    pub hour: u32,
    pub minute: u32,
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Result of a successful time sync: the correction to apply to the local
/// system clock plus the configured zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockHandle {
    pub offset_ms: i64,
    pub timezone_hours: i32,
}

impl ClockHandle {
    pub fn new(offset_ms: i64, timezone_hours: i32) -> Self {
        Self {
            offset_ms,
            timezone_hours,
        }
    }

    pub fn corrected_epoch_ms(&self, system_epoch_ms: i64) -> i64 {
        system_epoch_ms + self.offset_ms
    }

    pub fn local_offset(&self, dst_delta_hours: i32) -> FixedOffset {
        local_offset(self.timezone_hours, dst_delta_hours)
    }

    pub fn local_time(&self, system_epoch_ms: i64, dst_delta_hours: i32) -> LocalTime {
        let epoch_ms = self.corrected_epoch_ms(system_epoch_ms);
        let shifted = epoch_ms.div_euclid(1_000)
            + i64::from(self.timezone_hours + dst_delta_hours) * 3_600;
        let secs_of_day = shifted.rem_euclid(86_400);
        LocalTime {
            hour: (secs_of_day / 3_600) as u32,
            minute: ((secs_of_day % 3_600) / 60) as u32,
        }
    }
}

pub fn local_offset(timezone_hours: i32, dst_delta_hours: i32) -> FixedOffset {
    FixedOffset::east_opt((timezone_hours + dst_delta_hours) * 3_600).unwrap_or(Utc.fix())
}

/// 1 when the zone name reads like a daylight-saving variant.
pub fn dst_delta_from_zone_name(zone_name: &str) -> i32 {
    let lowered = zone_name.to_ascii_lowercase();
    i32::from(DST_MARKERS.iter().any(|marker| lowered.contains(marker)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClockState {
    pub last_sync_epoch: Option<i64>,
    pub dst_delta_hours: i32,
    pub last_update_epoch_ms: Option<i64>,
}

impl ClockState {
    pub fn record_sync(&mut self, epoch_secs: i64) {
        self.last_sync_epoch = Some(epoch_secs);
    }

    /// Each part is applied only when the poll carried it.
    pub fn record_update(&mut self, last_update_epoch_ms: Option<i64>, zone_name: Option<&str>) {
        if let Some(epoch_ms) = last_update_epoch_ms {
            self.last_update_epoch_ms = Some(epoch_ms);
        }
        if let Some(name) = zone_name {
            self.dst_delta_hours = dst_delta_from_zone_name(name);
        }
    }

    pub fn since_update_label(&self, now: LocalTime, timezone_hours: i32) -> String {
        match self.last_update_epoch_ms {
            Some(epoch_ms) => match DateTime::from_timestamp_millis(epoch_ms) {
                Some(last) => time_since_update_label(
                    now,
                    LocalTime {
                        hour: last.hour(),
                        minute: last.minute(),
                    },
                    timezone_hours,
                    self.dst_delta_hours,
                ),
                None => NO_UPDATE_LABEL.to_string(),
            },
            None => NO_UPDATE_LABEL.to_string(),
        }
    }
}

/// `last_utc` holds the UTC hour and minute of the device's last upload.
pub fn time_since_update_label(
    now: LocalTime,
    last_utc: LocalTime,
    timezone_hours: i32,
    dst_delta_hours: i32,
) -> String {
    let delta_min = (now.minute as i32 - last_utc.minute as i32).rem_euclid(60) as u32;
    let delta_hour = (now.hour as i32 - (last_utc.hour as i32 + timezone_hours + dst_delta_hours))
        .rem_euclid(24) as u32;

    if delta_min == 0 && delta_hour == 0 {
        "Now".to_string()
    } else if delta_min > STALE_AFTER_MINUTES || delta_hour > 1 {
        "No data".to_string()
    } else {
        format!("{delta_min} min ago")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(hour: u32, minute: u32) -> LocalTime {
        LocalTime { hour, minute }
    }

    #[test]
    fn labels_follow_minute_and_hour_deltas() {
        assert_eq!(time_since_update_label(at(10, 30), at(10, 30), 0, 0), "Now");
        assert_eq!(
            time_since_update_label(at(10, 35), at(10, 30), 0, 0),
            "5 min ago"
        );
        assert_eq!(
            time_since_update_label(at(10, 46), at(10, 30), 0, 0),
            "No data"
        );
        assert_eq!(
            time_since_update_label(at(12, 30), at(10, 30), 0, 0),
            "No data"
        );
    }

    #[test]
    fn labels_wrap_around_the_hour_and_zone() {
        // 23:58 UTC seen from UTC+1 summer time at 01:02 local.
        assert_eq!(
            time_since_update_label(at(1, 2), at(23, 58), 1, 1),
            "4 min ago"
        );
    }

    #[test]
    fn label_without_update_is_placeholder() {
        let state = ClockState::default();
        assert_eq!(state.since_update_label(at(8, 0), 0), NO_UPDATE_LABEL);
    }

    #[test]
    fn state_label_uses_utc_fields_of_last_update() {
        let mut state = ClockState::default();
        // 2024-07-01T09:55:00Z
        state.record_update(Some(1_719_827_700_000), Some("Central European Summer Time"));

        assert_eq!(state.dst_delta_hours, 1);
        assert_eq!(state.since_update_label(at(11, 57), 1), "2 min ago");

        state.record_update(None, Some("Central European Time"));
        assert_eq!(state.dst_delta_hours, 0);
        assert_eq!(state.last_update_epoch_ms, Some(1_719_827_700_000));
    }

    #[test]
    fn detects_daylight_saving_names() {
        assert_eq!(dst_delta_from_zone_name("Central European Summer Time"), 1);
        assert_eq!(dst_delta_from_zone_name("Pacific Daylight Time"), 1);
        assert_eq!(dst_delta_from_zone_name("Central European Standard Time"), 0);
    }

    #[test]
    fn local_time_applies_offset_zone_and_dst() {
        let handle = ClockHandle::new(-30_000, -5);
        // 2024-01-01T03:10:30Z, corrected by -30 s to 03:10:00.
        let local = handle.local_time(1_704_078_630_000, 1);

        assert_eq!(local, at(23, 10));
        assert_eq!(local.to_string(), "23:10");
    }
}
