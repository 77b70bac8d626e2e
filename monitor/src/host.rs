use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::{mpsc, watch, Mutex},
};
use tracing::{debug, info, warn};

use minimed_common::{
    config::{DeviceConfig, MonitorSettings},
    ClockHandle, DeviceSnapshot, FaultTable, FetchError, MonitorAction, MonitorEngine,
    Provisioner, ProvisioningReason, ProvisioningResponse, Screen, SyncError, TaskId,
};

const DEFAULT_STATUS_PORT: u16 = 8080;
const DEFAULT_PROVISIONING_PORT: u16 = 8090;
const NTP_PORT: u16 = 123;
const NTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    settings_path: Arc<PathBuf>,
    fault_table_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct TouchAccepted {
    accepted: bool,
}

#[derive(Clone)]
struct StatusState {
    screen: watch::Receiver<Screen>,
    touches: mpsc::Sender<()>,
}

#[derive(Clone)]
struct ProvisioningAppState {
    provisioner: Arc<Mutex<Provisioner>>,
    store: AppStore,
    accepted: mpsc::Sender<DeviceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boot {
    Restart,
    Shutdown,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    loop {
        let mut settings = store.load_settings().await.unwrap_or_else(|err| {
            warn!("failed to load monitor settings from store: {err:#}");
            MonitorSettings::default()
        });
        settings.sanitize();

        let entries = store.load_config_entries().await.unwrap_or_else(|err| {
            warn!("failed to read device configuration: {err:#}");
            HashMap::new()
        });

        let boot = match DeviceConfig::from_entries(|key| entries.get(key).cloned()) {
            Ok(config) => {
                info!(
                    "device config loaded: proxy=`{}:{}`, ntp=`{}`, timezone={}",
                    config.proxy_address,
                    config.proxy_port,
                    config.ntp_server,
                    config.timezone_offset_hours
                );
                run_monitor(&store, config, settings, shutdown_rx.clone()).await?
            }
            Err(err) => {
                warn!("device configuration incomplete ({err}); entering provisioning");
                let port = env_port("MINIMED_PROVISIONING_PORT", DEFAULT_PROVISIONING_PORT);
                let addr = SocketAddr::from(([0, 0, 0, 0], port));
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind provisioning server at {addr}"))?;
                info!("provisioning form on http://{addr}/");

                let provisioner = Provisioner::new(|key| entries.get(key).cloned());
                provision(
                    &store,
                    provisioner,
                    ProvisioningReason::InvalidConfig(err),
                    listener,
                    Duration::from_millis(settings.restart_grace_ms),
                    shutdown_rx.clone(),
                )
                .await?
            }
        };

        match boot {
            Boot::Restart => info!("restarting monitor"),
            Boot::Shutdown => return Ok(()),
        }
    }
}

async fn run_monitor(
    store: &AppStore,
    config: DeviceConfig,
    settings: MonitorSettings,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Boot> {
    let faults = store.load_fault_table().await.unwrap_or_else(|err| {
        warn!("failed to load fault code table: {err:#}");
        FaultTable::default()
    });
    info!("fault code table has {} entries", faults.len());

    let mut engine = MonitorEngine::new(settings, config.timezone_offset_hours, faults);
    let poller = Poller::new(config.telemetry_url())?;
    let fetch_deadline = Duration::from_millis(engine.settings().fetch_deadline_ms);

    let (screen_tx, screen_rx) = watch::channel(engine.screen().clone());
    let (touch_tx, mut touch_rx) = mpsc::channel(16);

    let port = env_port("MINIMED_STATUS_PORT", DEFAULT_STATUS_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;
    info!("status server listening on http://{addr}");
    let server = tokio::spawn(serve_status(
        listener,
        StatusState {
            screen: screen_rx,
            touches: touch_tx,
        },
        shutdown.clone(),
    ));

    let Some(mut clock) =
        initial_clock_sync(&mut engine, &config, &screen_tx, &mut shutdown).await
    else {
        server.abort();
        return Ok(Boot::Shutdown);
    };

    engine.start(monotonic_ms());
    let mut interval =
        tokio::time::interval(Duration::from_millis(engine.settings().tick_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            Some(()) = touch_rx.recv() => {
                execute_actions(engine.touch(monotonic_ms()));
            }
            _ = cancelled(&mut shutdown) => break,
        }

        execute_actions(engine.tick(monotonic_ms()));

        for task in engine.take_due() {
            match task {
                TaskId::PumpDataUpdate => {
                    engine.begin_fetch_cycle();
                    publish_screen(&screen_tx, engine.screen());

                    let result = poller.fetch(fetch_deadline, &mut shutdown.clone()).await;
                    if let Err(err) = &result {
                        warn!("pump data update failed: {err}");
                    }
                    let now_epoch = clock.corrected_epoch_ms(Utc::now().timestamp_millis()) / 1_000;
                    let report = engine.apply_fetch(result, now_epoch);
                    for failure in &report.failures {
                        warn!(field = failure.path(), "telemetry field skipped: {failure}");
                    }
                    execute_actions(report.actions);
                }
                TaskId::NtpSync => {
                    match sync_clock(&config.ntp_server, config.timezone_offset_hours).await {
                        Ok(handle) => {
                            clock = handle;
                            engine.record_clock_sync(Utc::now().timestamp());
                            debug!("clock resynchronised, offset {} ms", handle.offset_ms);
                        }
                        Err(err) => warn!("periodic time sync failed, keeping clock: {err}"),
                    }
                }
                TaskId::TimeUpdate => {
                    let now = clock.local_time(Utc::now().timestamp_millis(), engine.dst_delta_hours());
                    engine.refresh_time(now);
                }
                TaskId::RestoreBrightness => {}
            }
        }

        publish_screen(&screen_tx, engine.screen());
    }

    if let Err(err) = server.await {
        warn!("status server task ended abnormally: {err}");
    }
    Ok(Boot::Shutdown)
}

/// Blocks until the first successful sync. The syncing notice stays on
/// screen while attempts keep failing.
async fn initial_clock_sync(
    engine: &mut MonitorEngine,
    config: &DeviceConfig,
    screen: &watch::Sender<Screen>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<ClockHandle> {
    let retry = Duration::from_millis(engine.settings().clock_retry_ms);

    loop {
        match sync_clock(&config.ntp_server, config.timezone_offset_hours).await {
            Ok(handle) => {
                engine.record_clock_sync(Utc::now().timestamp());
                publish_screen(screen, engine.screen());
                info!("time and date synchronised via `{}`", config.ntp_server);
                return Some(handle);
            }
            Err(err) => {
                warn!("time sync failed, retrying: {err}");
                engine.set_clock_syncing(true);
                publish_screen(screen, engine.screen());
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            _ = cancelled(shutdown) => return None,
        }
    }
}

fn publish_screen(screen_tx: &watch::Sender<Screen>, screen: &Screen) {
    screen_tx.send_if_modified(|current| {
        if current == screen {
            return false;
        }
        render_screen(current, screen);
        *current = screen.clone();
        true
    });
}

fn render_screen(previous: &Screen, next: &Screen) {
    if previous.display != next.display {
        info!(
            glucose = %next.display.glucose,
            insulin = %next.display.active_insulin,
            battery = %next.display.battery.asset(),
            reservoir = %next.display.reservoir.asset(),
            "display updated"
        );
    }
    if previous.alarm_message != next.alarm_message {
        if let Some(message) = &next.alarm_message {
            warn!("alarm: {message}");
        }
    }
    if previous.fetch_notice != next.fetch_notice {
        if let Some(notice) = &next.fetch_notice {
            warn!("notice: {notice:?}");
        }
    }
    if previous.clock_text != next.clock_text || previous.last_update_text != next.last_update_text
    {
        debug!("clock {} | last update {}", next.clock_text, next.last_update_text);
    }
}

fn execute_actions(actions: Vec<MonitorAction>) {
    for action in actions {
        match action {
            MonitorAction::PlaySound(sound) => info!("playing sound `{}`", sound.asset()),
            MonitorAction::SetBrightness(level) => info!("backlight set to {level}%"),
        }
    }
}

struct Poller {
    client: reqwest::Client,
    url: String,
}

impl Poller {
    fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, url })
    }

    /// Single GET bounded by `deadline`; a cancellation signal aborts the
    /// request in flight.
    async fn fetch(
        &self,
        deadline: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<DeviceSnapshot, FetchError> {
        if *cancel.borrow() {
            return Err(FetchError::Cancelled);
        }

        tokio::select! {
            result = tokio::time::timeout(deadline, self.request()) => match result {
                Ok(result) => result,
                Err(_) => Err(FetchError::DeadlineExceeded {
                    after_ms: deadline.as_millis().try_into().unwrap_or(u64::MAX),
                }),
            },
            _ = cancelled(cancel) => Err(FetchError::Cancelled),
        }
    }

    async fn request(&self) -> Result<DeviceSnapshot, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(DeviceSnapshot::from_slice(&body)?)
    }
}

struct NtpSocket(UdpSocket);

impl sntpc::NtpUdpSocket for NtpSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> sntpc::Result<usize> {
        self.0
            .send_to(buf, addr)
            .await
            .map_err(|_| sntpc::Error::Network)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> sntpc::Result<(usize, SocketAddr)> {
        self.0
            .recv_from(buf)
            .await
            .map_err(|_| sntpc::Error::Network)
    }
}

async fn sync_clock(server: &str, timezone_hours: i32) -> Result<ClockHandle, SyncError> {
    let resolve_error = |reason: String| SyncError::Resolve {
        server: server.to_string(),
        reason,
    };
    let addr = tokio::net::lookup_host((server, NTP_PORT))
        .await
        .map_err(|err| resolve_error(err.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| resolve_error("no IPv4 address".to_string()))?;

    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
        .await
        .map_err(|err| SyncError::Network(err.to_string()))?;
    let context = sntpc::NtpContext::new(sntpc::StdTimestampGen::default());

    let result = tokio::time::timeout(
        NTP_TIMEOUT,
        sntpc::get_time(addr, &NtpSocket(socket), context),
    )
    .await
    .map_err(|_| SyncError::Timeout {
        after_ms: NTP_TIMEOUT.as_millis() as u64,
    })?
    .map_err(|err| SyncError::Network(format!("{err:?}")))?;

    Ok(ClockHandle::new(result.offset() / 1_000, timezone_hours))
}

async fn serve_status(
    listener: TcpListener,
    state: StatusState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/touch", post(handle_touch))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancelled(&mut shutdown).await })
        .await?;
    Ok(())
}

async fn handle_get_status(State(state): State<StatusState>) -> impl IntoResponse {
    let screen = state.screen.borrow().clone();
    Json(screen)
}

async fn handle_touch(State(state): State<StatusState>) -> impl IntoResponse {
    if state.touches.send(()).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Monitor loop is not running");
    }
    (StatusCode::ACCEPTED, Json(TouchAccepted { accepted: true })).into_response()
}

/// Serves the configuration form until a complete submission is persisted,
/// then waits out the restart grace period.
async fn provision(
    store: &AppStore,
    mut provisioner: Provisioner,
    reason: ProvisioningReason,
    listener: TcpListener,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Boot> {
    provisioner.enter_ap_mode(reason);
    provisioner.await_submission();
    let provisioner = Arc::new(Mutex::new(provisioner));

    let (accepted_tx, mut accepted_rx) = mpsc::channel(1);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let app = Router::new()
        .fallback(handle_provisioning)
        .with_state(ProvisioningAppState {
            provisioner: provisioner.clone(),
            store: store.clone(),
            accepted: accepted_tx,
        });
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancelled(&mut stop_rx).await })
            .await
    });

    let boot = tokio::select! {
        Some(config) = accepted_rx.recv() => {
            info!("configuration for `{}` saved; restarting", config.wifi_ssid);
            provisioner.lock().await.mark_restarting();
            tokio::time::sleep(grace).await;
            Boot::Restart
        }
        _ = cancelled(&mut shutdown) => Boot::Shutdown,
    };

    let _ = stop_tx.send(true);
    match server.await {
        Ok(result) => result.context("provisioning server failed")?,
        Err(err) => warn!("provisioning server task ended abnormally: {err}"),
    }
    Ok(boot)
}

async fn handle_provisioning(
    State(state): State<ProvisioningAppState>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let mut provisioner = state.provisioner.lock().await;
    match provisioner.handle_request(uri.path(), &params) {
        ProvisioningResponse::Page(page) => Html(page).into_response(),
        ProvisioningResponse::Accepted { config, page } => {
            if let Err(err) = state.store.save_device_config(&config).await {
                warn!("failed to persist provisioning submission: {err:#}");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to persist configuration",
                );
            }
            provisioner.mark_persisted();
            if state.accepted.send(config).await.is_err() {
                warn!("provisioning workflow no longer waiting for a submission");
            }
            Html(page).into_response()
        }
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("MINIMED_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.minimed"));
        let fault_table_path = std::env::var("MINIMED_FAULT_TABLE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("fault_codes.json"));

        Self::with_paths(data_dir, fault_table_path)
    }

    fn with_paths(data_dir: PathBuf, fault_table_path: PathBuf) -> Self {
        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            settings_path: Arc::new(data_dir.join("settings.json")),
            fault_table_path: Arc::new(fault_table_path),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_config_entries(&self) -> anyhow::Result<HashMap<String, String>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<HashMap<String, String>>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_device_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entries: HashMap<&str, String> = config.to_entries().into_iter().collect();
        let payload = serde_json::to_vec_pretty(&entries)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    async fn load_settings(&self) -> anyhow::Result<MonitorSettings> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.settings_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<MonitorSettings>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(MonitorSettings::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_fault_table(&self) -> anyhow::Result<FaultTable> {
        match tokio::fs::read(self.fault_table_path.as_ref()).await {
            Ok(raw) => Ok(FaultTable::from_json(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(FaultTable::default()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Resolves once the flag flips to true. A dropped sender never cancels.
async fn cancelled(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;

    async fn spawn_app(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn telemetry_url(addr: SocketAddr) -> String {
        format!("http://{addr}/carelink/nohistory")
    }

    fn temp_store(dir: &tempfile::TempDir) -> AppStore {
        AppStore::with_paths(dir.path().to_path_buf(), dir.path().join("fault_codes.json"))
    }

    #[tokio::test]
    async fn poller_returns_snapshot_on_success() {
        let app = Router::new().route(
            "/carelink/nohistory",
            get(|| async { Json(json!({ "lastSG": { "sg": 120 } })) }),
        );
        let addr = spawn_app(app).await;
        let poller = Poller::new(telemetry_url(addr)).unwrap();
        let (_tx, mut cancel) = watch::channel(false);

        let snapshot = poller
            .fetch(Duration::from_secs(5), &mut cancel)
            .await
            .unwrap();

        assert_eq!(snapshot.i64("lastSG.sg").unwrap(), 120);
    }

    #[tokio::test]
    async fn poller_maps_status_and_body_failures() {
        let app = Router::new()
            .route(
                "/carelink/nohistory",
                get(|| async { StatusCode::BAD_GATEWAY }),
            )
            .route("/empty/carelink/nohistory", get(|| async { "" }));
        let addr = spawn_app(app).await;
        let (_tx, mut cancel) = watch::channel(false);

        let status = Poller::new(telemetry_url(addr))
            .unwrap()
            .fetch(Duration::from_secs(5), &mut cancel)
            .await;
        assert_eq!(status, Err(FetchError::Status(502)));

        let empty = Poller::new(format!("http://{addr}/empty/carelink/nohistory"))
            .unwrap()
            .fetch(Duration::from_secs(5), &mut cancel)
            .await;
        assert!(matches!(empty, Err(FetchError::InvalidBody(_))));
    }

    #[tokio::test]
    async fn poller_reports_connection_failure_as_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_tx, mut cancel) = watch::channel(false);

        let result = Poller::new(telemetry_url(addr))
            .unwrap()
            .fetch(Duration::from_secs(5), &mut cancel)
            .await;

        assert!(matches!(result, Err(FetchError::Transport(_))));
    }

    #[tokio::test]
    async fn stuck_request_hits_deadline() {
        let app = Router::new().route(
            "/carelink/nohistory",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(json!({}))
            }),
        );
        let addr = spawn_app(app).await;
        let (_tx, mut cancel) = watch::channel(false);

        let result = Poller::new(telemetry_url(addr))
            .unwrap()
            .fetch(Duration::from_millis(200), &mut cancel)
            .await;

        assert_eq!(result, Err(FetchError::DeadlineExceeded { after_ms: 200 }));
    }

    #[tokio::test]
    async fn cancellation_aborts_request_in_flight() {
        let app = Router::new().route(
            "/carelink/nohistory",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(json!({}))
            }),
        );
        let addr = spawn_app(app).await;
        let (tx, mut cancel) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let result = Poller::new(telemetry_url(addr))
            .unwrap()
            .fetch(Duration::from_secs(10), &mut cancel)
            .await;

        assert_eq!(result, Err(FetchError::Cancelled));
    }

    #[tokio::test]
    async fn failing_clock_sync_keeps_notice_and_retries_until_shutdown() {
        let settings = MonitorSettings {
            clock_retry_ms: 20,
            ..MonitorSettings::default()
        };
        let mut engine = MonitorEngine::new(settings, 0, FaultTable::default());
        // An IPv6-only literal resolves without DNS and has no IPv4 address.
        let config = DeviceConfig {
            wifi_ssid: "home".to_string(),
            wifi_password: "secret".to_string(),
            proxy_address: "127.0.0.1".to_string(),
            proxy_port: 8081,
            ntp_server: "::1".to_string(),
            timezone_offset_hours: 0,
        };
        let (screen_tx, mut screen_rx) = watch::channel(engine.screen().clone());
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            screen_rx
                .wait_for(|screen| screen.sync_notice.is_some())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop_tx.send(true).unwrap();
        });

        let handle = initial_clock_sync(&mut engine, &config, &screen_tx, &mut stop_rx).await;
        stopper.await.unwrap();

        assert_eq!(handle, None);
        assert_eq!(
            engine.screen().sync_notice.as_deref(),
            Some(minimed_common::clock::SYNCING_NOTICE)
        );
        assert_eq!(engine.clock().last_sync_epoch, None);
    }

    #[tokio::test]
    async fn store_round_trips_device_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        assert!(store.load_config_entries().await.unwrap().is_empty());

        let config = DeviceConfig {
            wifi_ssid: "home".to_string(),
            wifi_password: "secret".to_string(),
            proxy_address: "192.168.1.20".to_string(),
            proxy_port: 8081,
            ntp_server: "pool.ntp.org".to_string(),
            timezone_offset_hours: 1,
        };
        store.save_device_config(&config).await.unwrap();

        let entries = store.load_config_entries().await.unwrap();
        assert_eq!(entries.get("proxyaddr").map(String::as_str), Some("192.168.1.20"));
        assert_eq!(
            DeviceConfig::from_entries(|key| entries.get(key).cloned()).unwrap(),
            config
        );
        assert_eq!(store.load_fault_table().await.unwrap(), FaultTable::default());
    }

    #[tokio::test]
    async fn status_server_exposes_screen_and_forwards_touches() {
        let engine = MonitorEngine::new(MonitorSettings::default(), 0, FaultTable::default());
        let (_screen_tx, screen_rx) = watch::channel(engine.screen().clone());
        let (touch_tx, mut touch_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_status(
            listener,
            StatusState {
                screen: screen_rx,
                touches: touch_tx,
            },
            stop_rx,
        ));

        let client = reqwest::Client::new();
        let status: Value = client
            .get(format!("http://{addr}/api/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["clock"], "--:--");
        assert_eq!(status["lastUpdate"], "---");
        assert_eq!(status["display"]["glucose"], "--");

        let touch = client
            .post(format!("http://{addr}/api/touch"))
            .send()
            .await
            .unwrap();
        assert_eq!(touch.status(), reqwest::StatusCode::ACCEPTED);
        assert_eq!(touch_rx.recv().await, Some(()));
    }

    #[tokio::test]
    async fn provisioning_persists_complete_submission_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let workflow = tokio::spawn({
            let store = store.clone();
            async move {
                provision(
                    &store,
                    Provisioner::new(|_| None),
                    ProvisioningReason::NetworkJoinFailed { attempts: 5 },
                    listener,
                    Duration::from_millis(10),
                    shutdown_rx,
                )
                .await
            }
        });

        let client = reqwest::Client::new();
        let form = client
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let incomplete = client
            .get(format!(
                "http://{addr}/m5config?fwifissid=home&fwifipass=&fntpserver=pool.ntp.org&ftimezone=1&fproxyaddr=10.0.0.2&fproxyport=8081"
            ))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(incomplete, form);
        assert!(store.load_config_entries().await.unwrap().is_empty());

        let saved = client
            .get(format!(
                "http://{addr}/m5config?fwifissid=home&fwifipass=s3cret&fntpserver=pool.ntp.org&ftimezone=1&fproxyaddr=10.0.0.2&fproxyport=8081"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(saved.status(), reqwest::StatusCode::OK);

        assert_eq!(workflow.await.unwrap().unwrap(), Boot::Restart);
        let entries = store.load_config_entries().await.unwrap();
        let config = DeviceConfig::from_entries(|key| entries.get(key).cloned()).unwrap();
        assert_eq!(config.wifi_password, "s3cret");
        assert_eq!(config.proxy_address, "10.0.0.2");
        assert_eq!(config.timezone_offset_hours, 1);
        assert_eq!(entries.len(), 6);
    }
}
