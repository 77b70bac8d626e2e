use std::collections::HashMap;

use serde::Serialize;

use crate::config::{
    self, ConfigError, DeviceConfig, DEFAULT_NTP_SERVER, DEFAULT_PROXY_PORT,
    DEFAULT_TIMEZONE_HOURS,
};

pub const SUBMIT_PATH: &str = "/m5config";
pub const AP_SSID: &str = "MinimedMonitor-AP";

const FIELD_WIFI_SSID: &str = "fwifissid";
const FIELD_WIFI_PASSWORD: &str = "fwifipass";
const FIELD_NTP_SERVER: &str = "fntpserver";
const FIELD_TIMEZONE: &str = "ftimezone";
const FIELD_PROXY_ADDRESS: &str = "fproxyaddr";
const FIELD_PROXY_PORT: &str = "fproxyport";

const SUCCESS_PAGE: &str = "<!doctype html>\
<html><head><meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<title>Minimed Monitor</title></head><body>\
<h2>Configuration saved</h2>\
<p>The monitor restarts now and joins the configured network.</p>\
</body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProvisioningState {
    Unconfigured,
    ApMode,
    AwaitingSubmission,
    Persisted,
    Restarting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningReason {
    InvalidConfig(ConfigError),
    NetworkJoinFailed { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningResponse {
    Page(String),
    Accepted { config: DeviceConfig, page: String },
}

impl ProvisioningResponse {
    pub fn body(&self) -> &str {
        match self {
            Self::Page(page) | Self::Accepted { page, .. } => page,
        }
    }
}

/// First-run workflow: serve a form, accept one complete submission, then
/// hand the result back to the runtime to persist and restart.
#[derive(Debug, Clone)]
pub struct Provisioner {
    state: ProvisioningState,
    reason: Option<ProvisioningReason>,
    wifi_ssid: String,
    ntp_server: String,
    timezone: String,
    proxy_address: String,
    proxy_port: String,
}

impl Provisioner {
    /// `known` exposes whatever the config store still holds; the password is
    /// never read back.
    pub fn new<F>(mut known: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |key: &str, default: String| {
            known(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(default)
        };

        Self {
            state: ProvisioningState::Unconfigured,
            reason: None,
            wifi_ssid: get(config::KEY_WIFI_SSID, String::new()),
            ntp_server: get(config::KEY_NTP_SERVER, DEFAULT_NTP_SERVER.to_string()),
            timezone: get(config::KEY_TIMEZONE, DEFAULT_TIMEZONE_HOURS.to_string()),
            proxy_address: get(config::KEY_PROXY_ADDRESS, String::new()),
            proxy_port: get(config::KEY_PROXY_PORT, DEFAULT_PROXY_PORT.to_string()),
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn reason(&self) -> Option<&ProvisioningReason> {
        self.reason.as_ref()
    }

    pub fn enter_ap_mode(&mut self, reason: ProvisioningReason) {
        self.reason = Some(reason);
        self.state = ProvisioningState::ApMode;
    }

    pub fn await_submission(&mut self) {
        if self.state == ProvisioningState::ApMode {
            self.state = ProvisioningState::AwaitingSubmission;
        }
    }

    pub fn mark_persisted(&mut self) {
        self.state = ProvisioningState::Persisted;
    }

    pub fn mark_restarting(&mut self) {
        self.state = ProvisioningState::Restarting;
    }

    pub fn handle_request(
        &mut self,
        path: &str,
        params: &HashMap<String, String>,
    ) -> ProvisioningResponse {
        if matches!(
            self.state,
            ProvisioningState::Persisted | ProvisioningState::Restarting
        ) {
            return ProvisioningResponse::Page(SUCCESS_PAGE.to_string());
        }

        if !path.contains(SUBMIT_PATH) {
            return ProvisioningResponse::Page(self.render_form());
        }

        match accept_submission(params) {
            Some(config) => ProvisioningResponse::Accepted {
                config,
                page: SUCCESS_PAGE.to_string(),
            },
            None => ProvisioningResponse::Page(self.render_form()),
        }
    }

    pub fn render_form(&self) -> String {
        let input = |label: &str, name: &str, kind: &str, value: &str| {
            format!(
                "<label>{label}<br><input type=\"{kind}\" name=\"{name}\" value=\"{}\"></label><br>",
                escape_html(value)
            )
        };

        let mut page = String::from(
            "<!doctype html>\
<html><head><meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<title>Minimed Monitor</title></head><body>\
<h2>Minimed Monitor setup</h2>",
        );
        page.push_str(&format!("<form action=\"{SUBMIT_PATH}\" method=\"get\">"));
        page.push_str(&input("WiFi SSID", FIELD_WIFI_SSID, "text", &self.wifi_ssid));
        page.push_str(&input("WiFi password", FIELD_WIFI_PASSWORD, "password", ""));
        page.push_str(&input("NTP server", FIELD_NTP_SERVER, "text", &self.ntp_server));
        page.push_str(&input(
            "Time zone (hours from UTC)",
            FIELD_TIMEZONE,
            "text",
            &self.timezone,
        ));
        page.push_str(&input(
            "Proxy address",
            FIELD_PROXY_ADDRESS,
            "text",
            &self.proxy_address,
        ));
        page.push_str(&input("Proxy port", FIELD_PROXY_PORT, "text", &self.proxy_port));
        page.push_str("<input type=\"submit\" value=\"Save\"></form></body></html>");
        page
    }
}

fn accept_submission(params: &HashMap<String, String>) -> Option<DeviceConfig> {
    let field = |name: &str| {
        params
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    };

    let wifi_ssid = field(FIELD_WIFI_SSID)?;
    let wifi_password = params
        .get(FIELD_WIFI_PASSWORD)
        .filter(|value| !value.is_empty())?;
    let ntp_server = field(FIELD_NTP_SERVER)?;
    let timezone = config::parse_timezone(field(FIELD_TIMEZONE)?).ok()?;
    let proxy_address = field(FIELD_PROXY_ADDRESS)?;
    let proxy_port = config::parse_port(field(FIELD_PROXY_PORT)?).ok()?;

    Some(DeviceConfig {
        wifi_ssid: wifi_ssid.to_string(),
        wifi_password: wifi_password.clone(),
        proxy_address: proxy_address.to_string(),
        proxy_port,
        ntp_server: ntp_server.to_string(),
        timezone_offset_hours: timezone,
    })
}

pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Splits and percent-decodes the query part of a request URI.
pub fn parse_query(uri: &str) -> HashMap<String, String> {
    let Some((_, query)) = uri.split_once('?') else {
        return HashMap::new();
    };

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn submission(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn complete() -> HashMap<String, String> {
        submission(&[
            ("fwifissid", "home"),
            ("fwifipass", "secret"),
            ("fntpserver", "pool.ntp.org"),
            ("ftimezone", "2"),
            ("fproxyaddr", "192.168.1.20"),
            ("fproxyport", "8081"),
        ])
    }

    fn provisioner() -> Provisioner {
        let mut provisioner = Provisioner::new(|key| match key {
            "wifissid" => Some("old-network".to_string()),
            "wifipass" => Some("old-secret".to_string()),
            _ => None,
        });
        provisioner.enter_ap_mode(ProvisioningReason::NetworkJoinFailed { attempts: 5 });
        provisioner.await_submission();
        provisioner
    }

    #[test]
    fn form_is_prefilled_without_password() {
        let provisioner = provisioner();
        let form = provisioner.render_form();

        assert!(form.contains("value=\"old-network\""));
        assert!(form.contains("value=\"pool.ntp.org\""));
        assert!(form.contains("value=\"8081\""));
        assert!(!form.contains("old-secret"));
        assert_eq!(provisioner.state(), ProvisioningState::AwaitingSubmission);
    }

    #[test]
    fn incomplete_submission_serves_the_same_form() {
        let mut provisioner = provisioner();
        let form = provisioner.handle_request("/", &HashMap::new());

        let mut params = complete();
        params.insert("fproxyaddr".to_string(), String::new());
        let retry = provisioner.handle_request("/m5config", &params);

        assert_eq!(retry, form);
        assert_eq!(provisioner.state(), ProvisioningState::AwaitingSubmission);
    }

    #[test]
    fn complete_submission_is_accepted() {
        let mut provisioner = provisioner();

        let response = provisioner.handle_request("/m5config", &complete());

        let ProvisioningResponse::Accepted { config, page } = response else {
            panic!("expected accepted submission");
        };
        assert_eq!(
            config,
            DeviceConfig {
                wifi_ssid: "home".to_string(),
                wifi_password: "secret".to_string(),
                proxy_address: "192.168.1.20".to_string(),
                proxy_port: 8081,
                ntp_server: "pool.ntp.org".to_string(),
                timezone_offset_hours: 2,
            }
        );
        assert!(page.contains("Configuration saved"));

        provisioner.mark_persisted();
        provisioner.mark_restarting();
        assert_eq!(provisioner.state(), ProvisioningState::Restarting);
        assert!(matches!(
            provisioner.handle_request("/m5config", &complete()),
            ProvisioningResponse::Page(_)
        ));
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        let mut provisioner = provisioner();
        let mut params = complete();
        params.insert("fproxyport".to_string(), "http".to_string());

        assert!(matches!(
            provisioner.handle_request("/m5config", &params),
            ProvisioningResponse::Page(_)
        ));
    }

    #[test]
    fn form_values_are_escaped() {
        let provisioner = Provisioner::new(|key| {
            (key == "wifissid").then(|| "\"><script>".to_string())
        });

        let form = provisioner.render_form();

        assert!(form.contains("&quot;&gt;&lt;script&gt;"));
        assert!(!form.contains("<script>"));
    }

    #[test]
    fn parses_and_decodes_query_strings() {
        let params = parse_query("/m5config?fwifissid=My+Home%21&fwifipass=a%3Db&empty=&bad=%zz");

        assert_eq!(params["fwifissid"], "My Home!");
        assert_eq!(params["fwifipass"], "a=b");
        assert_eq!(params["empty"], "");
        assert_eq!(params["bad"], "%zz");
        assert!(parse_query("/").is_empty());
    }
}
