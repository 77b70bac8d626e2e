use serde::Serialize;
use thiserror::Error;

use crate::{
    alarm::{AlarmDecision, AlarmTracker, FaultTable, SoundClass},
    clock::{self, ClockState, LocalTime, CLOCK_PLACEHOLDER, NO_UPDATE_LABEL, SYNCING_NOTICE},
    config::MonitorSettings,
    reconcile::{reconcile, DisplayState},
    scheduler::{Scheduler, TaskId, TimerTask},
    snapshot::{DeviceSnapshot, FieldError, SnapshotError, LAST_ALARM},
};

pub const STUCK_NOTICE: &str = "Pump data request is stuck, waiting for the proxy";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("proxy answered with HTTP {0}")]
    Status(u16),
    #[error("unusable response body: {0}")]
    InvalidBody(#[from] SnapshotError),
    #[error("no response within {after_ms} ms")]
    DeadlineExceeded { after_ms: u64 },
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    PlaySound(SoundClass),
    SetBrightness(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum FetchNotice {
    TransportError(String),
    Stuck(String),
}

/// Everything the display renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Screen {
    pub display: DisplayState,
    #[serde(rename = "clock")]
    pub clock_text: String,
    #[serde(rename = "lastUpdate")]
    pub last_update_text: String,
    #[serde(rename = "alarmMessage")]
    pub alarm_message: Option<String>,
    #[serde(rename = "syncNotice")]
    pub sync_notice: Option<String>,
    #[serde(rename = "fetchNotice")]
    pub fetch_notice: Option<FetchNotice>,
    pub brightness: u8,
}

impl Screen {
    fn new(brightness: u8) -> Self {
        Self {
            display: DisplayState::default(),
            clock_text: CLOCK_PLACEHOLDER.to_string(),
            last_update_text: NO_UPDATE_LABEL.to_string(),
            alarm_message: None,
            sync_notice: None,
            fetch_notice: None,
            brightness,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub actions: Vec<MonitorAction>,
    pub failures: Vec<FieldError>,
}

#[derive(Debug, Clone)]
pub struct MonitorEngine {
    settings: MonitorSettings,
    timezone_hours: i32,
    scheduler: Scheduler,
    clock: ClockState,
    alarms: AlarmTracker,
    faults: FaultTable,
    screen: Screen,
}

impl MonitorEngine {
    pub fn new(mut settings: MonitorSettings, timezone_hours: i32, faults: FaultTable) -> Self {
        settings.sanitize();

        let mut scheduler = Scheduler::new();
        scheduler.register(TimerTask::periodic(
            TaskId::PumpDataUpdate,
            settings.pump_update_period_ms,
        ));
        scheduler.register(TimerTask::periodic(
            TaskId::NtpSync,
            settings.ntp_sync_period_ms,
        ));
        scheduler.register(TimerTask::periodic(
            TaskId::TimeUpdate,
            settings.time_update_period_ms,
        ));
        scheduler.register(TimerTask::one_shot(
            TaskId::RestoreBrightness,
            settings.brightness_restore_ms,
        ));

        Self {
            alarms: AlarmTracker::new(settings.alarm_window_secs),
            screen: Screen::new(settings.dim_brightness),
            settings,
            timezone_hours,
            scheduler,
            clock: ClockState::default(),
            faults,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn clock(&self) -> &ClockState {
        &self.clock
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn dst_delta_hours(&self) -> i32 {
        self.clock.dst_delta_hours
    }

    pub fn local_offset(&self) -> chrono::FixedOffset {
        clock::local_offset(self.timezone_hours, self.clock.dst_delta_hours)
    }

    /// Arms the periodic tasks and queues each of them once so the first
    /// loop pass fetches data and draws the clock straight away.
    pub fn start(&mut self, now_ms: u64) {
        for id in [TaskId::PumpDataUpdate, TaskId::NtpSync, TaskId::TimeUpdate] {
            self.scheduler.start(id, now_ms);
            self.scheduler.trigger(id);
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<MonitorAction> {
        self.scheduler
            .tick(now_ms)
            .into_iter()
            .filter_map(|id| match id {
                TaskId::RestoreBrightness => {
                    self.screen.brightness = self.settings.dim_brightness;
                    Some(MonitorAction::SetBrightness(self.settings.dim_brightness))
                }
                _ => None,
            })
            .collect()
    }

    pub fn take_due(&mut self) -> Vec<TaskId> {
        self.scheduler.take_due()
    }

    pub fn touch(&mut self, now_ms: u64) -> Vec<MonitorAction> {
        self.screen.brightness = self.settings.full_brightness;
        self.scheduler.start(TaskId::RestoreBrightness, now_ms);
        vec![MonitorAction::SetBrightness(self.settings.full_brightness)]
    }

    pub fn set_clock_syncing(&mut self, syncing: bool) {
        self.screen.sync_notice = syncing.then(|| SYNCING_NOTICE.to_string());
    }

    pub fn record_clock_sync(&mut self, epoch_secs: i64) {
        self.clock.record_sync(epoch_secs);
        self.set_clock_syncing(false);
    }

    pub fn refresh_time(&mut self, now: LocalTime) {
        self.screen.clock_text = now.to_string();
        self.screen.last_update_text = self.clock.since_update_label(now, self.timezone_hours);
    }

    /// A transport error shown by the previous cycle goes away as soon as a
    /// new cycle begins. The stuck notice stays until a fetch succeeds.
    pub fn begin_fetch_cycle(&mut self) {
        if matches!(self.screen.fetch_notice, Some(FetchNotice::TransportError(_))) {
            self.screen.fetch_notice = None;
        }
    }

    pub fn apply_fetch(
        &mut self,
        result: Result<DeviceSnapshot, FetchError>,
        now_epoch: i64,
    ) -> FetchReport {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(FetchError::Cancelled) => return FetchReport::default(),
            Err(err @ FetchError::DeadlineExceeded { .. }) => {
                self.screen.fetch_notice =
                    Some(FetchNotice::Stuck(format!("{STUCK_NOTICE} ({err})")));
                return FetchReport::default();
            }
            Err(err) => {
                if !matches!(self.screen.fetch_notice, Some(FetchNotice::Stuck(_))) {
                    self.screen.fetch_notice = Some(FetchNotice::TransportError(err.to_string()));
                }
                return FetchReport::default();
            }
        };

        self.screen.fetch_notice = None;
        let mut report = FetchReport::default();

        let zone_name = match snapshot.time_zone_name() {
            Ok(name) => Some(name),
            Err(err) => {
                report.failures.push(err);
                None
            }
        };
        let last_update = match snapshot.last_update_epoch_ms() {
            Ok(epoch_ms) => Some(epoch_ms),
            Err(err) => {
                report.failures.push(err);
                None
            }
        };
        self.clock.record_update(last_update, zone_name);

        self.alarms.clear();
        match snapshot.last_alarm(self.local_offset()) {
            Ok(record) => {
                if let AlarmDecision::Show { sound, .. } =
                    self.alarms.consider(&record, now_epoch, &self.faults)
                {
                    report.actions.push(MonitorAction::PlaySound(sound));
                }
            }
            Err(FieldError::Missing(path)) if path == LAST_ALARM => {}
            Err(err) => report.failures.push(err),
        }
        self.screen.alarm_message = self.alarms.active_message().map(str::to_string);

        let reconciled = reconcile(&self.screen.display, &snapshot, &self.settings.features);
        self.screen.display = reconciled.state;
        report.failures.extend(reconciled.failures);

        report
    }
}
