use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{rejection::FormRejection, Form, Path, Query, State},
    http::{header, StatusCode, Uri},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::{watch, Mutex},
    time::MissedTickBehavior,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use covercal_common::{
    discovery::discovery_reply, render_setup_page, ActuatorDriver, AlpacaReply, ClientParams,
    CoverCalibratorDevice, EngineEvent, RuntimeConfig, SetupChange, SimulatedActuator,
    StoredConfig, MAX_BRIGHTNESS,
};

type Params = Query<HashMap<String, String>>;
type FormParams = Result<Form<HashMap<String, String>>, FormRejection>;

#[derive(Clone)]
struct AppState {
    device: Arc<Mutex<CoverCalibratorDevice>>,
    driver: Arc<Mutex<SimulatedActuator>>,
    discovery_port: Arc<watch::Sender<u16>>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let runtime = load_or_repair_runtime(&store).await;

    let (device, driver) = build_device(&runtime);
    info!(
        "device ready: {} flap(s), movement {:?}, cover {}, calibrator {}",
        device.engine().flaps().len(),
        device.engine().movement(),
        device.engine().cover_state().as_str(),
        device.engine().calibrator_state().as_str()
    );

    let port = std::env::var("COVERCAL_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(11111);

    let (discovery_tx, discovery_rx) = watch::channel(device.discovery_port());
    let app_state = AppState {
        device: Arc::new(Mutex::new(device)),
        driver: Arc::new(Mutex::new(driver)),
        discovery_port: Arc::new(discovery_tx),
        store,
    };

    spawn_control_loop(
        app_state.clone(),
        Duration::from_millis(runtime.motion.tick_interval_ms),
    );
    spawn_discovery_loop(port, discovery_rx);

    let app = Router::new()
        .route(
            "/api/v1/covercalibrator/{device_number}/{method}",
            get(handle_device_get).put(handle_device_put),
        )
        .route("/management/apiversions", get(handle_api_versions))
        .route("/management/v1/description", get(handle_description))
        .route(
            "/management/v1/configureddevices",
            get(handle_configured_devices),
        )
        .route("/status", get(handle_get_status))
        .route("/restart", post(handle_restart))
        .route("/setup", get(handle_setup_page))
        .route(
            "/setup/v1/covercalibrator/{device_number}/setup",
            get(handle_setup_page),
        )
        .route("/setup/{form}", post(handle_server_setup))
        .route(
            "/setup/v1/covercalibrator/{device_number}/{form}",
            post(handle_device_setup),
        )
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind alpaca server at {addr}"))?;

    info!("alpaca server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn load_or_repair_runtime(store: &AppStore) -> RuntimeConfig {
    let loaded = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::from_stored(None, MAX_BRIGHTNESS)
    });

    let StoredConfig {
        config,
        needs_rewrite,
        reason,
    } = loaded;
    if needs_rewrite {
        warn!(
            "using default configuration ({})",
            reason.as_deref().unwrap_or("unknown reason")
        );
        if let Err(err) = store.save_runtime_config(&config).await {
            warn!("failed to rewrite runtime config: {err:#}");
        }
    }
    config
}

/// Fresh device with its outputs written once, as at power-on.
fn build_device(runtime: &RuntimeConfig) -> (CoverCalibratorDevice, SimulatedActuator) {
    let mut device = CoverCalibratorDevice::new(runtime);
    let mut driver = SimulatedActuator::new(runtime.hardware.topology.channel_count());
    log_engine_events(&device.sync_outputs(&mut driver));
    (device, driver)
}

fn spawn_control_loop(app_state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let events = {
                let mut device = app_state.device.lock().await;
                let mut driver = app_state.driver.lock().await;
                device.tick(&mut *driver)
            };

            if !events.is_empty() {
                log_engine_events(&events);
            }
        }
    });
}

fn spawn_discovery_loop(http_port: u16, mut port_rx: watch::Receiver<u16>) {
    tokio::spawn(async move {
        loop {
            let udp_port = *port_rx.borrow_and_update();
            let socket = match UdpSocket::bind(("0.0.0.0", udp_port)).await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!("failed to bind discovery socket on udp {udp_port}: {err}");
                    if port_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            info!("alpaca discovery listening on udp {udp_port}");

            let mut buf = [0u8; 256];
            loop {
                tokio::select! {
                    changed = port_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, peer)) => {
                            let Some(reply) = discovery_reply(&buf[..len], http_port) else {
                                continue;
                            };
                            match socket.send_to(&reply, peer).await {
                                Ok(_) => debug!("answered discovery from {peer}"),
                                Err(err) => warn!("discovery reply to {peer} failed: {err}"),
                            }
                        }
                        Err(err) => warn!("discovery receive error: {err}"),
                    }
                }
            }
        }
    });
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

async fn handle_device_get(
    State(state): State<AppState>,
    Path((device_number, method)): Path<(String, String)>,
    Query(params): Params,
) -> impl IntoResponse {
    let params = ClientParams::from_pairs(params);
    let reply = state
        .device
        .lock()
        .await
        .handle_get(&device_number, &method, &params);
    alpaca_response(reply)
}

async fn handle_device_put(
    State(state): State<AppState>,
    Path((device_number, method)): Path<(String, String)>,
    Query(query): Params,
    form: FormParams,
) -> impl IntoResponse {
    let params = merge_params(query, form);
    let reply = state
        .device
        .lock()
        .await
        .handle_put(&device_number, &method, &params);
    if reply.body.is_error() {
        debug!("PUT {method} rejected: {}", reply.body.error_message);
    }
    alpaca_response(reply)
}

async fn handle_api_versions(State(state): State<AppState>, Query(params): Params) -> impl IntoResponse {
    let params = ClientParams::from_pairs(params);
    Json(state.device.lock().await.api_versions(&params))
}

async fn handle_description(State(state): State<AppState>, Query(params): Params) -> impl IntoResponse {
    let params = ClientParams::from_pairs(params);
    Json(state.device.lock().await.description(&params))
}

async fn handle_configured_devices(
    State(state): State<AppState>,
    Query(params): Params,
) -> impl IntoResponse {
    let params = ClientParams::from_pairs(params);
    Json(state.device.lock().await.configured_devices(&params))
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.device.lock().await.status(Utc::now());
    Json(status)
}

async fn handle_restart(State(state): State<AppState>) -> impl IntoResponse {
    restart_device(&state).await;
    (
        StatusCode::FOUND,
        [(header::LOCATION, "/status")],
        Html("<!DOCTYPE html><html>Redirecting for restart</html>"),
    )
}

/// Powers the servos down and rebuilds the device from the store. Clears
/// sticky faults and drops the client connection, like a reboot would.
async fn restart_device(state: &AppState) {
    info!("restart requested, powering servos down");
    let runtime = load_or_repair_runtime(&state.store).await;

    let mut device = state.device.lock().await;
    let mut driver = state.driver.lock().await;
    if let Err(err) = driver.set_power(false) {
        warn!("servo power-off before restart failed: {err}");
    }
    let (fresh, fresh_driver) = build_device(&runtime);
    *device = fresh;
    *driver = fresh_driver;

    state.discovery_port.send_if_modified(|port| {
        let changed = *port != device.discovery_port();
        *port = device.discovery_port();
        changed
    });
    info!(
        "device restarted: cover {}, calibrator {}",
        device.engine().cover_state().as_str(),
        device.engine().calibrator_state().as_str()
    );
}

async fn handle_not_found(
    State(state): State<AppState>,
    uri: Uri,
    Query(params): Params,
) -> impl IntoResponse {
    let params = ClientParams::from_pairs(params);
    let reply = state.device.lock().await.unknown_route(&params, uri.path());
    alpaca_response(reply)
}

async fn handle_setup_page(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.device.lock().await;
    Html(render_setup_page(&device, None))
}

async fn handle_server_setup(
    State(state): State<AppState>,
    Path(form): Path<String>,
    fields: FormParams,
) -> impl IntoResponse {
    apply_setup_form(&state, &form, fields).await
}

async fn handle_device_setup(
    State(state): State<AppState>,
    Path((device_number, form)): Path<(String, String)>,
    fields: FormParams,
) -> impl IntoResponse {
    if device_number != "0" {
        let device = state.device.lock().await;
        let message = format!("device number {device_number} does not exist");
        return (
            StatusCode::BAD_REQUEST,
            Html(render_setup_page(&device, Some(&message))),
        );
    }
    apply_setup_form(&state, &form, fields).await
}

async fn apply_setup_form(
    state: &AppState,
    form: &str,
    fields: FormParams,
) -> (StatusCode, Html<String>) {
    let fields = merge_params(HashMap::new(), fields);
    let result = match SetupChange::parse(form, &fields) {
        Ok(change) => {
            let persists = change.persists();
            let applied = state.device.lock().await.apply_setup(change);
            applied.map(|()| persists)
        }
        Err(err) => Err(err),
    };

    let (status, message) = match result {
        Ok(persists) => {
            if persists {
                if let Err(err) = persist_runtime_from_state(state).await {
                    warn!("failed to persist setup change: {err:#}");
                }
            }
            info!("setup {form} applied");
            (StatusCode::OK, format!("{form} updated"))
        }
        Err(err) => {
            warn!("setup {form} rejected: {err}");
            (StatusCode::BAD_REQUEST, err.to_string())
        }
    };

    let device = state.device.lock().await;
    state.discovery_port.send_if_modified(|port| {
        let changed = *port != device.discovery_port();
        *port = device.discovery_port();
        changed
    });
    (status, Html(render_setup_page(&device, Some(&message))))
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("COVERCAL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.covercal"));
        Self::at(data_dir)
    }

    fn at(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<StoredConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(RuntimeConfig::from_stored(Some(&raw), MAX_BRIGHTNESS)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Ok(RuntimeConfig::from_stored(None, MAX_BRIGHTNESS))
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed to read {}", self.runtime_path.display())),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let settings = state.device.lock().await.persisted_settings();

    let mut runtime = state.store.load_runtime_config().await?.config;
    runtime.settings = settings;
    state.store.save_runtime_config(&runtime).await
}

fn merge_params(query: HashMap<String, String>, form: FormParams) -> ClientParams {
    let mut pairs = query;
    match form {
        Ok(Form(fields)) => pairs.extend(fields),
        Err(rejection) => debug!("no form body: {rejection}"),
    }
    ClientParams::from_pairs(pairs)
}

fn alpaca_response(reply: AlpacaReply) -> axum::response::Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_REQUEST);
    (status, Json(reply.body)).into_response()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use covercal_common::{CalibratorState, CoverState};

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("covercal-{name}-{}", std::process::id()))
    }

    fn test_state(runtime: &RuntimeConfig, store: AppStore, discovery_tx: watch::Sender<u16>) -> AppState {
        let (device, driver) = build_device(runtime);
        AppState {
            device: Arc::new(Mutex::new(device)),
            driver: Arc::new(Mutex::new(driver)),
            discovery_port: Arc::new(discovery_tx),
            store,
        }
    }

    #[tokio::test]
    async fn corrupt_store_is_replaced_with_defaults() {
        let dir = scratch_dir("corrupt");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("runtime.json"), b"{\"magic\":0}")
            .await
            .unwrap();
        let store = AppStore::at(dir.clone());

        let runtime = load_or_repair_runtime(&store).await;
        assert_eq!(runtime.settings.hostname, "espACC00");

        let reloaded = store.load_runtime_config().await.unwrap();
        assert!(!reloaded.needs_rewrite);

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn setup_changes_are_persisted() {
        let dir = scratch_dir("persist");
        let store = AppStore::at(dir.clone());
        let runtime = load_or_repair_runtime(&store).await;
        let (discovery_tx, mut discovery_rx) = watch::channel(runtime.settings.discovery_port);
        let state = test_state(&runtime, store.clone(), discovery_tx);

        let fields: FormParams = Ok(Form(HashMap::from([(
            "udpport".to_string(),
            "40000".to_string(),
        )])));
        let (status, _) = apply_setup_form(&state, "udpport", fields).await;
        assert_eq!(status, StatusCode::OK);
        assert!(discovery_rx.has_changed().unwrap());
        assert_eq!(*discovery_rx.borrow_and_update(), 40000);

        let reloaded = store.load_runtime_config().await.unwrap();
        assert_eq!(reloaded.config.settings.discovery_port, 40000);

        let fields: FormParams = Ok(Form(HashMap::from([(
            "flapcount".to_string(),
            "0".to_string(),
        )])));
        let (status, _) = apply_setup_form(&state, "flapcount", fields).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn restart_clears_faults_and_reloads_settings() {
        let dir = scratch_dir("restart");
        let store = AppStore::at(dir.clone());
        let runtime = load_or_repair_runtime(&store).await;
        let (discovery_tx, _discovery_rx) = watch::channel(runtime.settings.discovery_port);
        let state = test_state(&runtime, store.clone(), discovery_tx);

        let fields: FormParams = Ok(Form(HashMap::from([(
            "location".to_string(),
            "north dome".to_string(),
        )])));
        let (status, _) = apply_setup_form(&state, "location", fields).await;
        assert_eq!(status, StatusCode::OK);

        {
            let mut device = state.device.lock().await;
            let mut driver = state.driver.lock().await;
            driver.fail_illuminator(true);
            device.engine_mut().calibrator_on(100).unwrap();
            device.tick(&mut *driver);
            assert_eq!(device.engine().calibrator_state(), CalibratorState::Error);
            device.engine_mut().open_cover().unwrap();
            device.tick(&mut *driver);
            assert!(driver.power());
        }

        let response = handle_restart(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/status");

        let device = state.device.lock().await;
        let driver = state.driver.lock().await;
        assert_eq!(device.engine().calibrator_state(), CalibratorState::Off);
        assert_eq!(device.engine().cover_state(), CoverState::Closed);
        assert_eq!(device.location(), "north dome");
        assert!(!driver.power());

        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}
