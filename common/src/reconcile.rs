use serde::Serialize;

use crate::{
    config::DisplayFeatures,
    snapshot::{self, DeviceSnapshot, FieldError},
};

pub const NO_GLUCOSE: &str = "--";
pub const NO_ACTIVE_INSULIN: &str = "-- U";

const SENSOR_HOURS_UNKNOWN: i64 = 255;
const SENSOR_HOURS_IN_DAYS_ABOVE: i64 = 9;
const CALIBRATION_UNKNOWN_HOURS: i64 = 255;
const CALIBRATION_PERIOD_HOURS: i64 = 12;
const CALIBRATION_RED_BELOW: i64 = 3;
const ARC_FULL: u16 = 359;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryIcon {
    Level(u8),
    Unknown,
}

impl BatteryIcon {
    pub fn asset(&self) -> String {
        match self {
            Self::Level(percent) => format!("mm_batt{percent}"),
            Self::Unknown => "mm_batt_unk".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservoirIcon {
    Level(u16),
    Unknown,
}

impl ReservoirIcon {
    pub fn asset(&self) -> String {
        match self {
            Self::Level(band) => format!("mm_tank{band}"),
            Self::Unknown => "mm_tank_unk".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorAgeIcon {
    Expired,
    Unknown,
    Green,
    Red,
}

impl SensorAgeIcon {
    pub fn asset(&self) -> &'static str {
        match self {
            Self::Expired => "mm_sage_expired",
            Self::Unknown => "mm_sage_unk",
            Self::Green => "mm_sage_green",
            Self::Red => "mm_sage_red",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorConnection {
    Ok,
    Lost,
}

impl SensorConnection {
    pub fn asset(&self) -> &'static str {
        match self {
            Self::Ok => "mm_sensor_connection_ok",
            Self::Lost => "mm_sensor_connection_nok",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ArcState {
    Unknown,
    FullGreen,
    ShrinkingGreen,
    ShrinkingRed,
    Empty { calibration_required: bool },
}

impl ArcState {
    /// Ring colour; `None` when no ring is drawn.
    pub fn colour(&self) -> Option<u32> {
        match self {
            Self::Unknown => Some(0x00cc_cc),
            Self::FullGreen | Self::ShrinkingGreen => Some(0x33cc_00),
            Self::ShrinkingRed => Some(0xff00_00),
            Self::Empty { .. } => None,
        }
    }

    pub fn drop_asset(&self) -> &'static str {
        match self {
            Self::Unknown => "mm_drop_unk",
            Self::Empty {
                calibration_required: true,
            } => "mm_drop_red",
            _ => "mm_drop_white",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationArc {
    pub state: ArcState,
    /// Angle of the consumed part of the ring, 0..=359 degrees.
    #[serde(rename = "endPos")]
    pub end_pos: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShieldIcon {
    Hidden,
    Trend(String),
}

impl ShieldIcon {
    pub fn asset(&self) -> Option<String> {
        match self {
            Self::Hidden => None,
            Self::Trend(trend) => Some(format!("mm_shield_{trend}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeSummary {
    #[serde(rename = "aboveRange")]
    pub above_range: String,
    #[serde(rename = "inRange")]
    pub in_range: String,
    #[serde(rename = "belowRange")]
    pub below_range: String,
    #[serde(rename = "averageSg")]
    pub average_sg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayState {
    pub reachable: bool,
    pub battery: BatteryIcon,
    pub reservoir: ReservoirIcon,
    #[serde(rename = "sensorAgeIcon")]
    pub sensor_age_icon: SensorAgeIcon,
    #[serde(rename = "sensorAgeText")]
    pub sensor_age_text: String,
    #[serde(rename = "sensorConnection")]
    pub sensor_connection: SensorConnection,
    pub calibration: CalibrationArc,
    pub shield: ShieldIcon,
    pub glucose: String,
    #[serde(rename = "activeInsulin")]
    pub active_insulin: String,
    pub banner: Option<String>,
    #[serde(rename = "statusMessage")]
    pub status_message: Option<String>,
    #[serde(rename = "rangeSummary")]
    pub range_summary: Option<RangeSummary>,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            reachable: false,
            battery: BatteryIcon::Unknown,
            reservoir: ReservoirIcon::Unknown,
            sensor_age_icon: SensorAgeIcon::Unknown,
            sensor_age_text: String::new(),
            sensor_connection: SensorConnection::Lost,
            calibration: CalibrationArc {
                state: ArcState::Unknown,
                end_pos: ARC_FULL,
            },
            shield: ShieldIcon::Trend("none".to_string()),
            glucose: NO_GLUCOSE.to_string(),
            active_insulin: NO_ACTIVE_INSULIN.to_string(),
            banner: None,
            status_message: None,
            range_summary: None,
        }
    }
}

impl DisplayState {
    fn apply_unreachable(&mut self) {
        self.battery = BatteryIcon::Unknown;
        self.reservoir = ReservoirIcon::Unknown;
        self.sensor_age_icon = SensorAgeIcon::Unknown;
        self.sensor_age_text.clear();
        self.active_insulin = NO_ACTIVE_INSULIN.to_string();
        self.shield = ShieldIcon::Hidden;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub state: DisplayState,
    pub failures: Vec<FieldError>,
}

pub fn reservoir_level(units: f64) -> u16 {
    if units > 150.0 {
        200
    } else if units > 80.0 {
        150
    } else if units > 0.0 {
        50
    } else {
        0
    }
}

pub fn sensor_age_text(hours: i64) -> String {
    if hours == SENSOR_HOURS_UNKNOWN {
        String::new()
    } else if hours > SENSOR_HOURS_IN_DAYS_ABOVE {
        format!("{}", (hours as f64 / 24.0).round_ties_even() as i64)
    } else {
        hours.to_string()
    }
}

pub fn sensor_age_icon(hours: i64, sensor_state: &str) -> SensorAgeIcon {
    if sensor_state == "CHANGE_SENSOR" {
        SensorAgeIcon::Expired
    } else if hours == SENSOR_HOURS_UNKNOWN {
        SensorAgeIcon::Unknown
    } else if hours > SENSOR_HOURS_IN_DAYS_ABOVE {
        SensorAgeIcon::Green
    } else {
        SensorAgeIcon::Red
    }
}

pub fn calibration_arc(
    calibration_free: bool,
    hours_to_calibration: i64,
    sensor_state: &str,
    calibration_status: &str,
) -> CalibrationArc {
    // Out-of-range feed values fold into the unknown marker.
    let hours_to_calibration = hours_to_calibration.clamp(0, CALIBRATION_UNKNOWN_HOURS);
    let consumed = 360 * (CALIBRATION_PERIOD_HOURS - hours_to_calibration) / CALIBRATION_PERIOD_HOURS;
    let end_pos = consumed.clamp(0, i64::from(ARC_FULL)) as u16;

    let unknown = (hours_to_calibration == CALIBRATION_UNKNOWN_HOURS
        || calibration_status == "UNKNOWN")
        && !calibration_free;

    let state = if unknown {
        ArcState::Unknown
    } else if hours_to_calibration >= CALIBRATION_PERIOD_HOURS {
        ArcState::FullGreen
    } else if hours_to_calibration > CALIBRATION_RED_BELOW {
        ArcState::ShrinkingGreen
    } else if hours_to_calibration > 0 {
        ArcState::ShrinkingRed
    } else {
        ArcState::Empty {
            calibration_required: sensor_state == "CALIBRATION_REQUIRED",
        }
    };

    CalibrationArc { state, end_pos }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Collects failures while each display unit is reconciled on its own.
struct Pass<'a> {
    snapshot: &'a DeviceSnapshot,
    failures: Vec<FieldError>,
}

impl Pass<'_> {
    fn take<T>(&mut self, result: Result<T, FieldError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.failures.push(err);
                None
            }
        }
    }

    /// Absent is a normal value for optional fields; only a wrong type counts.
    fn optional<T>(&mut self, result: Result<T, FieldError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(FieldError::Missing(_)) => None,
            Err(err) => {
                self.failures.push(err);
                None
            }
        }
    }

    fn reachable(&mut self) -> bool {
        let conduit = self.take(self.snapshot.bool(snapshot::CONDUIT_IN_RANGE));
        let device = self.take(self.snapshot.bool(snapshot::DEVICE_IN_RANGE));
        conduit.unwrap_or(false) && device.unwrap_or(false)
    }

    fn sensor_state(&mut self) -> String {
        self.optional(self.snapshot.str(snapshot::SENSOR_STATE))
            .unwrap_or_default()
            .to_string()
    }
}

/// Projects `snapshot` onto the display. Units whose fields fail keep their
/// value from `previous` unless they define a fallback.
pub fn reconcile(
    previous: &DisplayState,
    snapshot: &DeviceSnapshot,
    features: &DisplayFeatures,
) -> Reconciled {
    let mut next = previous.clone();
    let mut pass = Pass {
        snapshot,
        failures: Vec::new(),
    };

    next.reachable = pass.reachable();
    let sensor_state = pass.sensor_state();

    if next.reachable {
        if let Some(percent) = pass.take(snapshot.i64(snapshot::BATTERY_PERCENT)) {
            next.battery = BatteryIcon::Level(percent.clamp(0, 100) as u8);
        }

        match snapshot.f64(snapshot::RESERVOIR_UNITS) {
            Ok(units) => next.reservoir = ReservoirIcon::Level(reservoir_level(units)),
            Err(FieldError::Missing(_)) => next.reservoir = ReservoirIcon::Level(0),
            Err(err) => pass.failures.push(err),
        }

        if features.sensor_age {
            if let Some(hours) = pass.take(snapshot.i64(snapshot::SENSOR_HOURS)) {
                next.sensor_age_icon = sensor_age_icon(hours, &sensor_state);
                next.sensor_age_text = sensor_age_text(hours);
            }
        }

        if let Some(amount) = pass.take(snapshot.f64(snapshot::ACTIVE_INSULIN)) {
            next.active_insulin = format!("{amount:.1} U");
        }
    } else {
        next.apply_unreachable();
    }

    if let Some(in_range) = pass.take(snapshot.bool(snapshot::SENSOR_IN_RANGE)) {
        next.sensor_connection = if in_range {
            SensorConnection::Ok
        } else {
            SensorConnection::Lost
        };
    }

    if let Some(hours) = pass.take(snapshot.i64(snapshot::HOURS_TO_CALIBRATION)) {
        let calibration_free = pass
            .optional(snapshot.bool(snapshot::CALIBRATION_FREE))
            .unwrap_or(false);
        let calibration_status = pass
            .optional(snapshot.str(snapshot::CALIBRATION_STATUS))
            .unwrap_or_default();
        next.calibration =
            calibration_arc(calibration_free, hours, &sensor_state, calibration_status);
    }

    if next.reachable {
        if let Some(shield_state) = pass.take(snapshot.str(snapshot::SHIELD_STATE)) {
            if shield_state == "FEATURE_OFF" {
                next.shield = ShieldIcon::Hidden;
            } else if let Some(trend) = pass.take(snapshot.str(snapshot::SG_TREND)) {
                next.shield = ShieldIcon::Trend(trend.to_lowercase());
            }
        }
    }

    if let Some(glucose) = pass.take(snapshot.f64(snapshot::LAST_SG)) {
        next.glucose = if glucose > 0.0 {
            format_number(glucose)
        } else {
            NO_GLUCOSE.to_string()
        };
    }

    if features.banner {
        next.banner = pass
            .optional(snapshot.str(snapshot::BANNER_TYPE))
            .filter(|banner| !banner.is_empty())
            .map(|banner| format!("mm_banner_{}", banner.to_lowercase()));
    }

    if features.system_status {
        next.status_message = pass
            .optional(snapshot.str(snapshot::SYSTEM_STATUS))
            .filter(|status| *status != "NO_ERROR_MESSAGE" && !status.is_empty())
            .map(|status| status.replace('_', " "));
    }

    if features.range_summary {
        let above = pass.take(snapshot.f64(snapshot::ABOVE_RANGE));
        let within = pass.take(snapshot.f64(snapshot::IN_RANGE));
        let below = pass.take(snapshot.f64(snapshot::BELOW_RANGE));
        let average = pass.take(snapshot.f64(snapshot::AVERAGE_SG));
        if let (Some(above), Some(within), Some(below), Some(average)) =
            (above, within, below, average)
        {
            next.range_summary = Some(RangeSummary {
                above_range: format!("{} %", format_number(above)),
                in_range: format!("{} %", format_number(within)),
                below_range: format!("{} %", format_number(below)),
                average_sg: format!("{} mg/dl", format_number(average)),
            });
        }
    }

    Reconciled {
        state: next,
        failures: pass.failures,
    }
}
