use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KEY_WIFI_SSID: &str = "wifissid";
pub const KEY_WIFI_PASSWORD: &str = "wifipass";
pub const KEY_NTP_SERVER: &str = "ntpserver";
pub const KEY_TIMEZONE: &str = "timezone";
pub const KEY_PROXY_ADDRESS: &str = "proxyaddr";
pub const KEY_PROXY_PORT: &str = "proxyport";

pub const CONFIG_KEYS: [&str; 6] = [
    KEY_WIFI_SSID,
    KEY_WIFI_PASSWORD,
    KEY_NTP_SERVER,
    KEY_TIMEZONE,
    KEY_PROXY_ADDRESS,
    KEY_PROXY_PORT,
];

pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";
pub const DEFAULT_TIMEZONE_HOURS: i32 = 0;
pub const DEFAULT_PROXY_PORT: u16 = 8081;
pub const TELEMETRY_PATH: &str = "carelink/nohistory";
/// Upper bound for a fetch; stays below the 90 s device task watchdog.
pub const MAX_FETCH_DEADLINE_MS: u64 = 75_000;
pub const MAX_CLOCK_RETRY_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing configuration keys: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for `{key}`: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Network and proxy settings collected during provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub proxy_address: String,
    pub proxy_port: u16,
    pub ntp_server: String,
    pub timezone_offset_hours: i32,
}

impl DeviceConfig {
    /// Builds a configuration from a key/value source such as NVS or the
    /// host config file. Empty values count as absent.
    pub fn from_entries<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let wifi_ssid = get(KEY_WIFI_SSID);
        let wifi_password = get(KEY_WIFI_PASSWORD);
        let proxy_address = get(KEY_PROXY_ADDRESS);
        let ntp_server = get(KEY_NTP_SERVER);
        let timezone = get(KEY_TIMEZONE);
        let proxy_port = get(KEY_PROXY_PORT);

        let mut missing = Vec::new();
        if wifi_ssid.is_none() {
            missing.push(KEY_WIFI_SSID);
        }
        if wifi_password.is_none() {
            missing.push(KEY_WIFI_PASSWORD);
        }
        if proxy_address.is_none() {
            missing.push(KEY_PROXY_ADDRESS);
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let timezone_offset_hours = match timezone {
            Some(value) => parse_timezone(&value)?,
            None => DEFAULT_TIMEZONE_HOURS,
        };
        let proxy_port = match proxy_port {
            Some(value) => parse_port(&value)?,
            None => DEFAULT_PROXY_PORT,
        };

        Ok(Self {
            wifi_ssid: wifi_ssid.unwrap_or_default(),
            wifi_password: wifi_password.unwrap_or_default(),
            proxy_address: proxy_address.unwrap_or_default().trim().to_string(),
            proxy_port,
            ntp_server: ntp_server.unwrap_or_else(|| DEFAULT_NTP_SERVER.to_string()),
            timezone_offset_hours,
        })
    }

    pub fn to_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            (KEY_WIFI_SSID, self.wifi_ssid.clone()),
            (KEY_WIFI_PASSWORD, self.wifi_password.clone()),
            (KEY_NTP_SERVER, self.ntp_server.clone()),
            (KEY_TIMEZONE, self.timezone_offset_hours.to_string()),
            (KEY_PROXY_ADDRESS, self.proxy_address.clone()),
            (KEY_PROXY_PORT, self.proxy_port.to_string()),
        ]
    }

    pub fn telemetry_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.proxy_address, self.proxy_port, TELEMETRY_PATH
        )
    }
}

pub fn parse_timezone(value: &str) -> Result<i32, ConfigError> {
    value
        .trim()
        .trim_start_matches('+')
        .parse::<i32>()
        .ok()
        .filter(|hours| (-12..=14).contains(hours))
        .ok_or_else(|| ConfigError::Invalid {
            key: KEY_TIMEZONE,
            value: value.to_string(),
        })
}

pub fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ConfigError::Invalid {
            key: KEY_PROXY_PORT,
            value: value.to_string(),
        })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayFeatures {
    #[serde(rename = "sensorAge")]
    pub sensor_age: bool,
    pub banner: bool,
    #[serde(rename = "systemStatus")]
    pub system_status: bool,
    #[serde(rename = "rangeSummary")]
    pub range_summary: bool,
}

impl Default for DisplayFeatures {
    fn default() -> Self {
        Self {
            sensor_age: true,
            banner: true,
            system_status: true,
            range_summary: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub tick_interval_ms: u64,
    pub pump_update_period_ms: u64,
    pub ntp_sync_period_ms: u64,
    pub time_update_period_ms: u64,
    pub fetch_deadline_ms: u64,
    pub clock_retry_ms: u64,
    pub brightness_restore_ms: u64,
    pub dim_brightness: u8,
    pub full_brightness: u8,
    pub alarm_window_secs: i64,
    pub wifi_connect_attempts: u32,
    pub wifi_retry_delay_ms: u64,
    pub restart_grace_ms: u64,
    pub features: DisplayFeatures,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            pump_update_period_ms: 60_000,
            ntp_sync_period_ms: 1_200_000,
            time_update_period_ms: 10_000,
            fetch_deadline_ms: 60_000,
            clock_retry_ms: 1_000,
            brightness_restore_ms: 10_000,
            dim_brightness: 40,
            full_brightness: 100,
            alarm_window_secs: 15 * 60,
            wifi_connect_attempts: 5,
            wifi_retry_delay_ms: 1_000,
            restart_grace_ms: 3_000,
            features: DisplayFeatures::default(),
        }
    }
}

impl MonitorSettings {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.tick_interval_ms = self.tick_interval_ms.clamp(10, 1_000);
        for (value, default) in [
            (&mut self.pump_update_period_ms, defaults.pump_update_period_ms),
            (&mut self.ntp_sync_period_ms, defaults.ntp_sync_period_ms),
            (&mut self.time_update_period_ms, defaults.time_update_period_ms),
            (&mut self.fetch_deadline_ms, defaults.fetch_deadline_ms),
            (&mut self.clock_retry_ms, defaults.clock_retry_ms),
            (&mut self.brightness_restore_ms, defaults.brightness_restore_ms),
        ] {
            if *value == 0 {
                *value = default;
            }
        }

        self.fetch_deadline_ms = self.fetch_deadline_ms.min(MAX_FETCH_DEADLINE_MS);
        self.clock_retry_ms = self.clock_retry_ms.min(MAX_CLOCK_RETRY_MS);
        self.full_brightness = self.full_brightness.clamp(1, 100);
        self.dim_brightness = self.dim_brightness.min(self.full_brightness);
        if self.alarm_window_secs <= 0 {
            self.alarm_window_secs = defaults.alarm_window_secs;
        }
        self.wifi_connect_attempts = self.wifi_connect_attempts.max(1);
    }
}
