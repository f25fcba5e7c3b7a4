use core::convert::TryInto;
use std::{
    io::ErrorKind,
    net::UdpSocket,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals, reset},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use covercal_common::{
    discovery::discovery_reply, render_setup_page, ActuatorDriver, AlpacaReply, ClientParams,
    CoverCalibratorDevice, EngineEvent, NetworkConfig, RuntimeConfig, SetupChange, StoredConfig,
    MAX_BRIGHTNESS,
};

use crate::servo::{BoardActuator, UnavailableActuator};

const NVS_NAMESPACE: &str = "covercal";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 4096;
const ALPACA_HTTP_PORT: u16 = 11111;
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);
const WIFI_JOIN_ATTEMPTS: u32 = 5;
const WIFI_JOIN_BACKOFF: Duration = Duration::from_secs(3);
const RESTART_FLUSH_DELAY: Duration = Duration::from_millis(250);
const DISCOVERY_POLL_MS: u64 = 500;
const DEVICE_API_PREFIX: &str = "/api/v1/covercalibrator/";
const DEVICE_SETUP_PREFIX: &str = "/setup/v1/covercalibrator/";

type HttpRequest<'a, 'b> = Request<&'a mut EspHttpConnection<'b>>;

#[derive(Clone)]
struct SharedState {
    device: Arc<Mutex<CoverCalibratorDevice>>,
    restart_requested: Arc<AtomicBool>,
}

impl SharedState {
    fn device(&self) -> MutexGuard<'_, CoverCalibratorDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
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

    let mut runtime = load_or_repair_runtime(&nvs_store);
    ensure_wifi_defaults(&mut runtime.network);
    info!(
        "NVS config loaded: host=`{}`, {} flap(s), discovery udp {}",
        runtime.settings.hostname,
        runtime.settings.flaps.len(),
        runtime.settings.discovery_port
    );

    let Peripherals {
        modem, ledc, i2c0, ..
    } = Peripherals::take()?;

    let mut driver: Box<dyn ActuatorDriver + Send> =
        match BoardActuator::new(ledc, i2c0, &runtime.hardware) {
            Ok(actuator) => Box::new(actuator),
            Err(err) => {
                warn!("failed to initialize actuators: {err:#}");
                Box::new(UnavailableActuator::new(format!("{err:#}")))
            }
        };

    let mut device = CoverCalibratorDevice::new(&runtime);
    log_engine_events(&device.sync_outputs(&mut *driver));
    info!(
        "device ready: movement {:?}, cover {}, calibrator {}",
        device.engine().movement(),
        device.engine().cover_state().as_str(),
        device.engine().calibrator_state().as_str()
    );

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    TaskWatchdog::configure(WATCHDOG_TIMEOUT)?;

    let shared_state = SharedState {
        device: Arc::new(Mutex::new(device)),
        restart_requested: Arc::new(AtomicBool::new(false)),
    };

    spawn_control_loop(
        shared_state.clone(),
        driver,
        Duration::from_millis(runtime.motion.tick_interval_ms),
    )?;
    spawn_discovery_loop(shared_state.clone(), ALPACA_HTTP_PORT)?;

    let server = create_http_server(shared_state, nvs_store)?;
    info!("alpaca server listening on port {ALPACA_HTTP_PORT}");

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn load_or_repair_runtime(nvs_store: &NvsStore) -> RuntimeConfig {
    let StoredConfig {
        config,
        needs_rewrite,
        reason,
    } = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::from_stored(None, MAX_BRIGHTNESS)
    });

    if needs_rewrite {
        warn!(
            "using default configuration ({})",
            reason.as_deref().unwrap_or("unknown reason")
        );
        if let Err(err) = nvs_store.save_runtime_config(&config) {
            warn!("failed to rewrite runtime config: {err:#}");
        }
    }
    config
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

/// Joins the configured network as a station. Returns once the interface
/// has an address.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let station = station_config(network)?;

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    wifi.set_configuration(&Configuration::Client(station))?;
    wifi.start()?;
    info!("joining wifi `{}`", network.wifi_ssid);

    with_retries("wifi join", WIFI_JOIN_ATTEMPTS, WIFI_JOIN_BACKOFF, || {
        let joined = wifi.connect().and_then(|()| wifi.wait_netif_up());
        if joined.is_err() {
            let _ = wifi.disconnect();
        }
        joined
    })?;

    drop(wifi);
    Ok(esp_wifi)
}

fn station_config(network: &NetworkConfig) -> anyhow::Result<ClientConfiguration> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("no wifi ssid configured"));
    }
    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    Ok(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    })
}

/// Calls `attempt` up to `attempts` times, sleeping `backoff` between failures.
fn with_retries<E: std::fmt::Display>(
    what: &str,
    attempts: u32,
    backoff: Duration,
    mut attempt: impl FnMut() -> Result<(), E>,
) -> anyhow::Result<()> {
    for n in 1..=attempts {
        match attempt() {
            Ok(()) => {
                info!("{what} succeeded ({n}/{attempts})");
                return Ok(());
            }
            Err(err) if n == attempts => {
                return Err(anyhow!("{what} failed after {attempts} attempts: {err}"));
            }
            Err(err) => {
                warn!("{what} failed ({n}/{attempts}): {err}");
                thread::sleep(backoff);
            }
        }
    }
    Err(anyhow!("{what} was never attempted"))
}

fn spawn_control_loop(
    state: SharedState,
    mut driver: Box<dyn ActuatorDriver + Send>,
    period: Duration,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let watchdog = match TaskWatchdog::subscribe_current() {
                Ok(watchdog) => Some(watchdog),
                Err(err) => {
                    warn!("control loop runs without watchdog: {err:#}");
                    None
                }
            };

            loop {
                if let Some(watchdog) = &watchdog {
                    watchdog.feed();
                }
                if state.restart_requested.load(Ordering::Acquire) {
                    power_down_and_restart(&mut *driver);
                }
                let events = state.device().tick(&mut *driver);
                if !events.is_empty() {
                    log_engine_events(&events);
                }
                thread::sleep(period);
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn spawn_discovery_loop(state: SharedState, http_port: u16) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("discovery".into())
        .stack_size(6 * 1024)
        .spawn(move || loop {
            let udp_port = state.device().discovery_port();
            let socket = match bind_discovery_socket(udp_port) {
                Ok(socket) => socket,
                Err(err) => {
                    warn!("failed to bind discovery socket on udp {udp_port}: {err:#}");
                    thread::sleep(Duration::from_secs(5));
                    continue;
                }
            };
            info!("alpaca discovery listening on udp {udp_port}");

            let mut buf = [0_u8; 256];
            while state.device().discovery_port() == udp_port {
                match socket.recv_from(&mut buf) {
                    Ok((len, peer)) => {
                        let Some(reply) = discovery_reply(&buf[..len], http_port) else {
                            continue;
                        };
                        match socket.send_to(&reply, peer) {
                            Ok(_) => debug!("answered discovery from {peer}"),
                            Err(err) => warn!("discovery reply to {peer} failed: {err}"),
                        }
                    }
                    Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    Err(err) => warn!("discovery receive error: {err}"),
                }
            }
            info!("discovery port changed, rebinding");
        })
        .context("failed to spawn discovery thread")?;
    Ok(())
}

/// Servo power goes off before the chip resets, as with any other stop.
fn power_down_and_restart(driver: &mut dyn ActuatorDriver) -> ! {
    info!("restart requested, powering servos down");
    if let Err(err) = driver.set_power(false) {
        warn!("servo power-off before restart failed: {err}");
    }
    thread::sleep(RESTART_FLUSH_DELAY);
    reset::restart()
}

fn bind_discovery_socket(port: u16) -> anyhow::Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", port))?;
    socket.set_read_timeout(Some(Duration::from_millis(DISCOVERY_POLL_MS)))?;
    Ok(socket)
}

fn log_engine_events(events: &[EngineEvent]) {
    for event in events {
        match event {
            EngineEvent::CoverStateChanged { from, to } => {
                info!("cover {} -> {}", from.as_str(), to.as_str());
            }
            EngineEvent::CalibratorStateChanged { from, to } => {
                info!("calibrator {} -> {}", from.as_str(), to.as_str());
            }
            EngineEvent::ActuatorFault { axis, error } => {
                warn!("{} actuator fault: {error}", axis.as_str());
            }
            EngineEvent::WatchdogTripped { ticks } => {
                warn!("cover motion did not converge after {ticks} ticks");
            }
        }
    }
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: ALPACA_HTTP_PORT,
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/v1/covercalibrator/*", Method::Get, move |req| {
            let uri = req.uri().to_string();
            let (path, params) = split_uri(&uri);
            let reply = match device_route(path, DEVICE_API_PREFIX) {
                Some((device_number, method)) => {
                    state.device().handle_get(device_number, method, &params)
                }
                None => state.device().unknown_route(&params, path),
            };
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/v1/covercalibrator/*", Method::Put, move |mut req| {
            let uri = req.uri().to_string();
            let (path, mut params) = split_uri(&uri);
            params.extend(read_form_body(&mut req)?);
            let reply = match device_route(path, DEVICE_API_PREFIX) {
                Some((device_number, method)) => {
                    let reply = state.device().handle_put(device_number, method, &params);
                    if reply.body.is_error() {
                        debug!("PUT {method} rejected: {}", reply.body.error_message);
                    }
                    reply
                }
                None => state.device().unknown_route(&params, path),
            };
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/management/apiversions", Method::Get, move |req| {
            let (_, params) = split_uri(req.uri());
            let body = state.device().api_versions(&params);
            write_json(req, 200, &body)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/management/v1/description", Method::Get, move |req| {
            let (_, params) = split_uri(req.uri());
            let body = state.device().description(&params);
            write_json(req, 200, &body)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/management/v1/configureddevices", Method::Get, move |req| {
            let (_, params) = split_uri(req.uri());
            let body = state.device().configured_devices(&params);
            write_json(req, 200, &body)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/status", Method::Get, move |req| {
            let status = state.device().status(Utc::now());
            write_json(req, 200, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/restart", Method::Post, move |req| {
            req.into_response(
                302,
                None,
                &[
                    ("Location", "/status"),
                    ("Content-Type", "text/html; charset=utf-8"),
                ],
            )?
            .write_all(b"<!DOCTYPE html><html>Redirecting for restart</html>")?;
            state.restart_requested.store(true, Ordering::Release);
            Ok::<(), anyhow::Error>(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/setup", Method::Get, move |req| {
            let page = render_setup_page(&state.device(), None);
            write_html(req, 200, &page)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/setup/*", Method::Get, move |req| {
            let uri = req.uri().to_string();
            let (path, params) = split_uri(&uri);
            if path == "/setup/v1/covercalibrator/0/setup" {
                let page = render_setup_page(&state.device(), None);
                return write_html(req, 200, &page);
            }
            let reply = state.device().unknown_route(&params, path);
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/setup/*", Method::Post, move |mut req| {
            let uri = req.uri().to_string();
            let (path, mut fields) = split_uri(&uri);
            fields.extend(read_form_body(&mut req)?);

            let form = match device_route(path, DEVICE_SETUP_PREFIX) {
                Some(("0", form)) => form,
                Some((device_number, _)) => {
                    let message = format!("device number {device_number} does not exist");
                    let page = render_setup_page(&state.device(), Some(&message));
                    return write_html(req, 400, &page);
                }
                None => path.trim_start_matches("/setup/"),
            };

            let (status, page) = apply_setup_form(&state, &nvs_store, form, &fields);
            write_html(req, status, &page)
        })?;
    }

    for method in [Method::Get, Method::Put, Method::Post] {
        let state = state.clone();
        server.fn_handler("/*", method, move |req| {
            let uri = req.uri().to_string();
            let (path, params) = split_uri(&uri);
            let reply = state.device().unknown_route(&params, path);
            write_reply(req, reply)
        })?;
    }

    Ok(server)
}

fn apply_setup_form(
    state: &SharedState,
    nvs_store: &NvsStore,
    form: &str,
    fields: &ClientParams,
) -> (u16, String) {
    let result = SetupChange::parse(form, fields).and_then(|change| {
        let persists = change.persists();
        state.device().apply_setup(change).map(|()| persists)
    });

    let (status, message) = match result {
        Ok(persists) => {
            if persists {
                if let Err(err) = persist_runtime_from_state(nvs_store, state) {
                    warn!("failed to persist setup change: {err:#}");
                }
            }
            info!("setup {form} applied");
            (200, format!("{form} updated"))
        }
        Err(err) => {
            warn!("setup {form} rejected: {err}");
            (400, err.to_string())
        }
    };

    (status, render_setup_page(&state.device(), Some(&message)))
}

fn persist_runtime_from_state(nvs_store: &NvsStore, state: &SharedState) -> anyhow::Result<()> {
    let settings = state.device().persisted_settings();

    let mut runtime = nvs_store.load_runtime_config()?.config;
    runtime.settings = settings;
    nvs_store.save_runtime_config(&runtime)
}

/// Splits `/prefix/{device_number}/{method}` into its two trailing segments.
fn device_route<'a>(path: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = path.strip_prefix(prefix)?;
    let (device_number, method) = rest.split_once('/')?;
    if device_number.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((device_number, method))
}

fn split_uri(uri: &str) -> (&str, ClientParams) {
    match uri.split_once('?') {
        Some((path, query)) => (path, ClientParams::from_urlencoded(query)),
        None => (uri, ClientParams::default()),
    }
}

fn read_form_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<ClientParams> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(ClientParams::from_urlencoded(&String::from_utf8_lossy(&body)))
}

fn write_reply(req: HttpRequest<'_, '_>, reply: AlpacaReply) -> anyhow::Result<()> {
    write_json(req, reply.status, &reply.body)
}

fn write_json<T: Serialize>(
    req: HttpRequest<'_, '_>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_html(req: HttpRequest<'_, '_>, status_code: u16, page: &str) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/html; charset=utf-8")],
    )?
    .write_all(page.as_bytes())?;
    Ok(())
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<StoredConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        let raw = nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)?;
        Ok(RuntimeConfig::from_stored(
            raw.map(str::as_bytes),
            MAX_BRIGHTNESS,
        ))
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

/// Handle for a task subscribed to the ESP-IDF task watchdog.
struct TaskWatchdog;

impl TaskWatchdog {
    fn configure(timeout: Duration) -> anyhow::Result<()> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        watchdog_result("esp_task_wdt_init", unsafe {
            esp_idf_svc::sys::esp_task_wdt_init(&config)
        })
    }

    fn subscribe_current() -> anyhow::Result<Self> {
        watchdog_result("esp_task_wdt_add", unsafe {
            esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut())
        })?;
        Ok(Self)
    }

    fn feed(&self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

/// Already-initialized and already-subscribed both count as success.
fn watchdog_result(call: &str, rc: esp_idf_svc::sys::esp_err_t) -> anyhow::Result<()> {
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        Ok(())
    } else {
        Err(anyhow!("{call} failed with code {rc}"))
    }
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
