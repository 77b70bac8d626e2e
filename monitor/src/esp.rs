use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SntpConf, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use minimed_common::{
    config::{DeviceConfig, MonitorSettings, MAX_FETCH_DEADLINE_MS},
    provisioning::{self, AP_SSID},
    ClockHandle, ConfigError, DeviceSnapshot, FaultTable, FetchError, MonitorAction, MonitorEngine,
    Provisioner, ProvisioningReason, ProvisioningResponse, TaskId,
};

const NVS_NAMESPACE: &str = "minimed";
const NVS_SETTINGS_KEY: &str = "settings_json";
const NVS_FAULTS_KEY: &str = "fault_codes";
const MAX_HTTP_BODY: usize = 16 * 1024;
const HTTP_CHUNK_SIZE: usize = 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const NTP_RESYNC_POLLS: u32 = 10;

const _: () = assert!(MAX_FETCH_DEADLINE_MS < WATCHDOG_TIMEOUT_SEC as u64 * 1_000);

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>, ProvisioningReason),
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Serialize)]
struct TouchAccepted {
    accepted: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut settings = nvs_store.load_settings().unwrap_or_else(|err| {
        warn!("failed to load monitor settings from NVS: {err:#}");
        MonitorSettings::default()
    });
    settings.sanitize();

    let config = nvs_store.load_device_config();
    let Peripherals { modem, .. } = Peripherals::take()?;

    let startup = match &config {
        Ok(config) => {
            info!(
                "NVS config loaded: ssid=`{}`, proxy=`{}:{}`, ntp=`{}`, timezone={}",
                config.wifi_ssid,
                config.proxy_address,
                config.proxy_port,
                config.ntp_server,
                config.timezone_offset_hours
            );
            connect_wifi(modem, sys_loop, nvs_partition, config, &settings)
        }
        Err(err) => {
            warn!("device configuration incomplete ({err}); entering provisioning");
            start_provisioning_wifi(
                modem,
                sys_loop,
                nvs_partition,
                ProvisioningReason::InvalidConfig(err.clone()),
            )
        }
    }
    .context("wifi startup failed")?;

    let wifi = match startup {
        WifiStartup::Connected(wifi) => {
            info!("wifi connected");
            wifi
        }
        WifiStartup::Provisioning(wifi, reason) => {
            let server = create_provisioning_http_server(nvs_store, reason, &settings)?;
            info!("provisioning form available on the `{AP_SSID}` access point");

            let _wifi = wifi;
            let _server = server;
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    };
    let config = config.context("device configuration unavailable")?;

    let faults = nvs_store.load_fault_table().unwrap_or_else(|err| {
        warn!("failed to load fault code table from NVS: {err:#}");
        FaultTable::default()
    });
    info!("fault code table has {} entries", faults.len());

    let engine = Arc::new(Mutex::new(MonitorEngine::new(
        settings,
        config.timezone_offset_hours,
        faults,
    )));

    let mut sntp_conf = SntpConf::default();
    sntp_conf.servers[0] = config.ntp_server.as_str();
    let sntp = EspSntp::new(&sntp_conf).context("failed to start SNTP")?;
    wait_for_time_sync(&sntp, &engine, &config.ntp_server);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    spawn_monitor_loop(engine.clone(), config);

    let server = create_status_http_server(engine)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _sntp = sntp;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &DeviceConfig,
    settings: &MonitorSettings,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .wifi_password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", config.wifi_ssid);

    let attempts = settings.wifi_connect_attempts;
    let mut last_err = None;
    for attempt in 1..=attempts {
        info!("wifi connect attempt {attempt}/{attempts}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < attempts {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(settings.wifi_retry_delay_ms));
        }
    }

    match last_err {
        None => Ok(WifiStartup::Connected(esp_wifi)),
        Some(err) => {
            warn!("all {attempts} wifi connect attempts failed; last error: {err:#}");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi)?;
            Ok(WifiStartup::Provisioning(
                esp_wifi,
                ProvisioningReason::NetworkJoinFailed { attempts },
            ))
        }
    }
}

fn start_provisioning_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    reason: ProvisioningReason,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    start_provisioning_ap(&mut wifi)?;
    Ok(WifiStartup::Provisioning(esp_wifi, reason))
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{AP_SSID}`");
    Ok(())
}

fn create_provisioning_http_server(
    nvs_store: NvsStore,
    reason: ProvisioningReason,
    settings: &MonitorSettings,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    let mut provisioner = Provisioner::new(|key| nvs_store.get(key).ok().flatten());
    provisioner.enter_ap_mode(reason);
    provisioner.await_submission();
    let provisioner = Arc::new(Mutex::new(provisioner));
    let grace = Duration::from_millis(settings.restart_grace_ms);

    // Every path serves the form so captive-portal checks land on it too.
    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        let uri = req.uri().to_string();
        let path = uri.split('?').next().unwrap_or_default();
        let params = provisioning::parse_query(&uri);

        let mut provisioner = provisioner
            .lock()
            .map_err(|_| anyhow!("provisioner lock poisoned"))?;
        match provisioner.handle_request(path, &params) {
            ProvisioningResponse::Page(page) => {
                write_html(req, &page)?;
            }
            ProvisioningResponse::Accepted { config, page } => {
                if let Err(err) = nvs_store.save_device_config(&config) {
                    warn!("failed to persist provisioning submission: {err:#}");
                    return write_error(req, 500, "Failed to persist configuration");
                }
                provisioner.mark_persisted();
                info!("configuration for `{}` saved; restarting", config.wifi_ssid);
                write_html(req, &page)?;

                provisioner.mark_restarting();
                thread::Builder::new()
                    .name("prov-restart".into())
                    .spawn(move || {
                        thread::sleep(grace);
                        unsafe { esp_idf_svc::sys::esp_restart() };
                    })
                    .expect("failed to spawn restart thread");
            }
        }
        Ok(())
    })?;

    Ok(server)
}

fn create_status_http_server(
    engine: Arc<Mutex<MonitorEngine>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    {
        let engine = engine.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            let screen = engine
                .lock()
                .map_err(|_| anyhow!("engine lock poisoned"))?
                .screen()
                .clone();
            write_json(req, &screen)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/touch", Method::Post, move |req| {
        let actions = engine
            .lock()
            .map_err(|_| anyhow!("engine lock poisoned"))?
            .touch(monotonic_ms());
        execute_actions(actions);
        write_json(req, &TouchAccepted { accepted: true })
    })?;

    Ok(server)
}

/// Blocks until SNTP reports a completed sync, showing the syncing notice
/// while it waits.
fn wait_for_time_sync(sntp: &EspSntp<'static>, engine: &Arc<Mutex<MonitorEngine>>, server: &str) {
    let retry = match engine.lock() {
        Ok(engine) => Duration::from_millis(engine.settings().clock_retry_ms),
        Err(_) => Duration::from_secs(1),
    };

    while sntp.get_sync_status() != SyncStatus::Completed {
        if let Ok(mut engine) = engine.lock() {
            engine.set_clock_syncing(true);
        }
        info!("waiting for time sync via `{server}`");
        thread::sleep(retry);
    }

    if let Ok(mut engine) = engine.lock() {
        engine.record_clock_sync(Utc::now().timestamp());
    }
    info!("time and date synchronised via `{server}`");
}

fn spawn_monitor_loop(engine: Arc<Mutex<MonitorEngine>>, config: DeviceConfig) {
    thread::Builder::new()
        .name("monitor-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register monitor loop with watchdog: {err:#}");
            }

            // SNTP adjusts the system clock directly, so no offset is carried.
            let clock = ClockHandle::new(0, config.timezone_offset_hours);
            let url = config.telemetry_url();
            let (tick, deadline) = match engine.lock() {
                Ok(mut engine) => {
                    engine.start(monotonic_ms());
                    (
                        Duration::from_millis(engine.settings().tick_interval_ms),
                        Duration::from_millis(engine.settings().fetch_deadline_ms),
                    )
                }
                Err(_) => return,
            };

            loop {
                feed_watchdog();

                let due = match engine.lock() {
                    Ok(mut engine) => {
                        execute_actions(engine.tick(monotonic_ms()));
                        engine.take_due()
                    }
                    Err(_) => {
                        warn!("engine lock poisoned; stopping monitor loop");
                        return;
                    }
                };

                for task in due {
                    run_task(&engine, task, &url, deadline, &clock);
                    feed_watchdog();
                }

                thread::sleep(tick);
            }
        })
        .expect("failed to spawn monitor loop thread");
}

fn run_task(
    engine: &Arc<Mutex<MonitorEngine>>,
    task: TaskId,
    url: &str,
    deadline: Duration,
    clock: &ClockHandle,
) {
    match task {
        TaskId::PumpDataUpdate => {
            if let Ok(mut engine) = engine.lock() {
                engine.begin_fetch_cycle();
            }

            // The request runs without holding the engine so status stays readable.
            let result = fetch_snapshot(url, deadline);
            if let Err(err) = &result {
                warn!("pump data update failed: {err}");
            }

            if let Ok(mut engine) = engine.lock() {
                let report = engine.apply_fetch(result, Utc::now().timestamp());
                for failure in &report.failures {
                    warn!("telemetry field `{}` skipped: {failure}", failure.path());
                }
                execute_actions(report.actions);
            }
        }
        TaskId::NtpSync => {
            if resync_clock(engine) {
                if let Ok(mut engine) = engine.lock() {
                    engine.record_clock_sync(Utc::now().timestamp());
                }
                info!("clock resynchronised");
            } else {
                warn!("periodic time sync did not complete; keeping clock");
            }
        }
        TaskId::TimeUpdate => {
            if let Ok(mut engine) = engine.lock() {
                let now = clock.local_time(Utc::now().timestamp_millis(), engine.dst_delta_hours());
                engine.refresh_time(now);
            }
        }
        TaskId::RestoreBrightness => {}
    }
}

/// Restarts the SNTP exchange and polls briefly for its completion.
fn resync_clock(engine: &Arc<Mutex<MonitorEngine>>) -> bool {
    let retry = match engine.lock() {
        Ok(engine) => Duration::from_millis(engine.settings().clock_retry_ms),
        Err(_) => Duration::from_secs(1),
    };

    if !unsafe { esp_idf_svc::sys::sntp_restart() } {
        return false;
    }

    for _ in 0..NTP_RESYNC_POLLS {
        feed_watchdog();
        thread::sleep(retry);
        let status = unsafe { esp_idf_svc::sys::sntp_get_sync_status() };
        if status == esp_idf_svc::sys::sntp_sync_status_t_SNTP_SYNC_STATUS_COMPLETED {
            return true;
        }
    }
    false
}

fn fetch_snapshot(url: &str, deadline: Duration) -> Result<DeviceSnapshot, FetchError> {
    let started = Instant::now();
    let deadline_error = || FetchError::DeadlineExceeded {
        after_ms: deadline.as_millis().try_into().unwrap_or(u64::MAX),
    };
    let transport = |err: &dyn core::fmt::Debug| FetchError::Transport(format!("{err:?}"));

    let http_conf = HttpClientConfiguration {
        timeout: Some(deadline),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&http_conf).map_err(|err| transport(&err))?;
    let mut client = HttpClient::wrap(connection);
    let request = client
        .request(Method::Get, url, &[])
        .map_err(|err| transport(&err))?;
    let mut response = request.submit().map_err(|err| {
        if started.elapsed() >= deadline {
            deadline_error()
        } else {
            transport(&err)
        }
    })?;

    let status = response.status();
    if status != 200 {
        return Err(FetchError::Status(status));
    }

    let mut body = Vec::new();
    let mut chunk = [0_u8; HTTP_CHUNK_SIZE];
    loop {
        if started.elapsed() >= deadline {
            return Err(deadline_error());
        }
        let read = response.read(&mut chunk).map_err(|err| transport(&err))?;
        if read == 0 {
            break;
        }
        if body.len() + read > MAX_HTTP_BODY {
            return Err(FetchError::Transport("response body too large".to_string()));
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Ok(DeviceSnapshot::from_slice(&body)?)
}

fn execute_actions(actions: Vec<MonitorAction>) {
    for action in actions {
        match action {
            MonitorAction::PlaySound(sound) => info!("playing sound `{}`", sound.asset()),
            MonitorAction::SetBrightness(level) => info!("backlight set to {level}%"),
        }
    }
}

fn write_html(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    page: &str,
) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
        .write_all(page.as_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

impl NvsStore {
    fn nvs(&self) -> anyhow::Result<EspNvs<esp_idf_svc::nvs::NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let nvs = self.nvs()?;
        let mut buffer = vec![0_u8; 4096];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn load_device_config(&self) -> Result<DeviceConfig, ConfigError> {
        DeviceConfig::from_entries(|key| {
            self.get(key).unwrap_or_else(|err| {
                warn!("failed to read `{key}` from NVS: {err:#}");
                None
            })
        })
    }

    fn save_device_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let mut nvs = self.nvs()?;
        for (key, value) in config.to_entries() {
            nvs.set_str(key, &value)?;
        }
        Ok(())
    }

    fn load_settings(&self) -> anyhow::Result<MonitorSettings> {
        match self.get(NVS_SETTINGS_KEY)? {
            Some(value) => Ok(serde_json::from_str::<MonitorSettings>(&value)?),
            None => Ok(MonitorSettings::default()),
        }
    }

    fn load_fault_table(&self) -> anyhow::Result<FaultTable> {
        match self.get(NVS_FAULTS_KEY)? {
            Some(value) => Ok(FaultTable::from_json(value.as_bytes())?),
            None => Ok(FaultTable::default()),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
