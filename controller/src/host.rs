use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use relayswitch_common::{
    AccessPointSettings, ByteStore, CommandReply, ConfigForm, DeviceIdentity, HttpRequest,
    HttpResponse, HttpSurface, InboundMessage, MqttTransport, Platform, QoS, RadioError, RelayPin,
    RuntimeConfig, ScanEntry, SessionOptions, StationCredentials, StorageError, SwitchDevice, Tick,
    TransportError, WifiRadio, RECORD_LEN,
};

const SIMULATED_MAC: [u8; 6] = [0x02, 0x00, 0x5e, 0x10, 0x20, 0x30];
const SIMULATED_FREE_HEAP: u32 = 160 * 1024;
const DEVICE_TICK: Duration = Duration::from_millis(50);
const REQUEST_QUEUE_DEPTH: usize = 16;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_INBOX_DEPTH: usize = 32;

type HostDevice =
    SwitchDevice<FileStore, LoggingPin, SimulatedRadio, RumqttTransport, HostPlatform>;

struct PendingRequest {
    request: HttpRequest,
    reply: oneshot::Sender<HttpResponse>,
}

#[derive(Clone)]
struct RequestQueue {
    tx: mpsc::Sender<PendingRequest>,
}

/// Drains requests queued by the axum handlers on the device thread.
struct QueuedRequests {
    rx: mpsc::Receiver<PendingRequest>,
}

#[derive(Debug, Deserialize)]
struct SwitchQuery {
    state: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("RELAYSWITCH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.relayswitch"));

    let mut runtime = load_runtime_config(&data_dir).await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.broker.host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.broker.port = port;
    }

    let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    spawn_device_loop(
        runtime,
        data_dir.join("config.bin"),
        Handle::current(),
        QueuedRequests { rx },
    )?;

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/switch", post(handle_set_switch))
        .route("/on", get(handle_on))
        .route("/off", get(handle_off))
        .route("/save", post(handle_save))
        .route("/api/restart", post(handle_restart))
        .route("/api/scan", get(handle_scan))
        .fallback_service(ServeDir::new(web_root))
        .with_state(RequestQueue { tx });

    let port = std::env::var("RELAYSWITCH_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind switch server at {addr}"))?;

    info!("switch listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn load_runtime_config(data_dir: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(data_dir.join("runtime.json")).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

/// Runs the cooperative loop on its own thread. A restart drops every
/// adapter and boots a fresh device from the stored record.
fn spawn_device_loop(
    runtime: RuntimeConfig,
    record_path: PathBuf,
    handle: Handle,
    mut surface: QueuedRequests,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("device-loop".into())
        .spawn(move || loop {
            let mut device = build_device(&runtime, &record_path, &handle);
            device.boot(&mut surface);
            info!(
                "switch booted: hostname=`{}` wifi={} mqtt={}",
                device.device_config().hostname,
                device.connectivity_state().as_str(),
                device.mqtt_state().as_str(),
            );

            while device.tick(&mut surface) == Tick::Continue {
                thread::sleep(DEVICE_TICK);
            }
            info!("restarting switch");
        })
        .context("failed to spawn device loop")?;
    Ok(())
}

fn build_device(runtime: &RuntimeConfig, record_path: &Path, handle: &Handle) -> HostDevice {
    let identity = DeviceIdentity::from_mac(SIMULATED_MAC);
    SwitchDevice::new(
        runtime.clone(),
        &identity,
        FileStore::open(record_path.to_path_buf()),
        LoggingPin,
        SimulatedRadio::from_env(),
        RumqttTransport::new(handle.clone()),
        HostPlatform,
    )
}

async fn handle_get_status(State(queue): State<RequestQueue>) -> Response {
    dispatch(&queue, HttpRequest::Status).await
}

async fn handle_set_switch(
    State(queue): State<RequestQueue>,
    Query(query): Query<SwitchQuery>,
) -> Response {
    let Some(token) = query.state else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'state' parameter");
    };
    dispatch(
        &queue,
        HttpRequest::Command {
            token,
            reply: CommandReply::Json,
        },
    )
    .await
}

async fn handle_on(State(queue): State<RequestQueue>) -> Response {
    dispatch(
        &queue,
        HttpRequest::Command {
            token: "on".to_string(),
            reply: CommandReply::Redirect,
        },
    )
    .await
}

async fn handle_off(State(queue): State<RequestQueue>) -> Response {
    dispatch(
        &queue,
        HttpRequest::Command {
            token: "off".to_string(),
            reply: CommandReply::Redirect,
        },
    )
    .await
}

async fn handle_save(State(queue): State<RequestQueue>, body: String) -> Response {
    dispatch(&queue, HttpRequest::SaveConfig(ConfigForm::from_urlencoded(&body))).await
}

async fn handle_restart(State(queue): State<RequestQueue>) -> Response {
    dispatch(&queue, HttpRequest::Restart).await
}

async fn handle_scan(State(queue): State<RequestQueue>) -> Response {
    dispatch(&queue, HttpRequest::Scan).await
}

async fn dispatch(queue: &RequestQueue, request: HttpRequest) -> Response {
    let (reply, response) = oneshot::channel();
    if queue
        .tx
        .send(PendingRequest { request, reply })
        .await
        .is_err()
    {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Device loop is not running");
    }

    match tokio::time::timeout(REQUEST_TIMEOUT, response).await {
        Ok(Ok(response)) => into_response(response),
        _ => error_response(StatusCode::SERVICE_UNAVAILABLE, "Device loop did not answer"),
    }
}

fn into_response(response: HttpResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut reply = (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        Body::from(response.body),
    )
        .into_response();
    if let Some(location) = response.location {
        reply
            .headers_mut()
            .insert(header::LOCATION, HeaderValue::from_static(location));
    }
    reply
}

fn error_response(status: StatusCode, message: &str) -> Response {
    into_response(HttpResponse::error(status.as_u16(), message))
}

impl HttpSurface for QueuedRequests {
    fn serve(&mut self, handler: &mut dyn FnMut(HttpRequest) -> HttpResponse) {
        while let Ok(pending) = self.rx.try_recv() {
            let response = handler(pending.request);
            // The handler may have timed out and dropped its receiver.
            let _ = pending.reply.send(response);
        }
    }
}

/// The record image, mirrored to a file on commit.
struct FileStore {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileStore {
    fn open(path: PathBuf) -> Self {
        let mut image = vec![0xFF_u8; RECORD_LEN];
        match std::fs::read(&path) {
            Ok(raw) => {
                let len = raw.len().min(image.len());
                image[..len].copy_from_slice(&raw[..len]);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to read {}: {err}", path.display()),
        }
        Self { path, image }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), StorageError> {
        if offset.saturating_add(len) > self.image.len() {
            return Err(StorageError::OutOfRange {
                offset,
                len,
                capacity: self.image.len(),
            });
        }
        Ok(())
    }
}

impl ByteStore for FileStore {
    fn capacity(&self) -> usize {
        self.image.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_range(offset, buf.len())?;
        buf.copy_from_slice(&self.image[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_range(offset, bytes.len())?;
        self.image[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let backend = |err: std::io::Error| StorageError::Backend(err.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }
        let staged = self.path.with_extension("tmp");
        std::fs::write(&staged, &self.image).map_err(backend)?;
        std::fs::rename(&staged, &self.path).map_err(backend)?;
        Ok(())
    }
}

struct LoggingPin;

impl RelayPin for LoggingPin {
    fn set_level(&mut self, high: bool) {
        info!("relay pin driven {}", if high { "high" } else { "low" });
    }
}

/// Stands in for the radio. `RELAYSWITCH_SIM_WIFI=down` makes every
/// station association hang, which exercises the access-point fallback.
struct SimulatedRadio {
    network_available: bool,
    station: Option<StationCredentials>,
    associating: bool,
    scan_started: Option<Instant>,
}

impl SimulatedRadio {
    fn from_env() -> Self {
        let network_available = std::env::var("RELAYSWITCH_SIM_WIFI")
            .map(|value| value != "down")
            .unwrap_or(true);
        Self {
            network_available,
            station: None,
            associating: false,
            scan_started: None,
        }
    }
}

impl WifiRadio for SimulatedRadio {
    fn configure(
        &mut self,
        station: Option<&StationCredentials>,
        access_point: Option<&AccessPointSettings>,
    ) -> Result<(), RadioError> {
        match station {
            Some(station) => info!(
                "radio station `{}` as `{}`",
                station.ssid, station.hostname
            ),
            None => info!("radio station off"),
        }
        match access_point {
            Some(ap) => info!(
                "radio access point `{}` on {}.{}.{}.{}",
                ap.ssid, ap.gateway[0], ap.gateway[1], ap.gateway[2], ap.gateway[3]
            ),
            None => info!("radio access point off"),
        }
        if self.station.as_ref() != station {
            self.station = station.cloned();
            self.associating = false;
        }
        Ok(())
    }

    fn connect_station(&mut self) -> Result<(), RadioError> {
        if self.station.is_none() {
            return Err(RadioError::Driver("station is not configured".to_string()));
        }
        self.associating = true;
        Ok(())
    }

    fn station_connected(&self) -> bool {
        self.associating && self.network_available
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        self.scan_started = Some(Instant::now());
        Ok(())
    }

    fn scan_results(&mut self) -> Option<Vec<ScanEntry>> {
        let started = self.scan_started?;
        if started.elapsed() < Duration::from_millis(500) {
            return None;
        }
        self.scan_started = None;

        let mut networks = vec![
            ScanEntry {
                ssid: "Neighbour".to_string(),
                rssi: -78,
                secured: true,
            },
            ScanEntry {
                ssid: "CoffeeShop".to_string(),
                rssi: -85,
                secured: false,
            },
        ];
        if let Some(station) = self.station.as_ref().filter(|_| self.network_available) {
            networks.insert(
                0,
                ScanEntry {
                    ssid: station.ssid.clone(),
                    rssi: -52,
                    secured: !station.passphrase.is_empty(),
                },
            );
        }
        Some(networks)
    }
}

struct RumqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    inbox: mpsc::Receiver<InboundMessage>,
    task: JoinHandle<()>,
}

/// `rumqttc` behind the blocking transport seam. The event loop runs on the
/// tokio runtime; the device thread only touches channels and flags.
struct RumqttTransport {
    runtime: Handle,
    session: Option<RumqttSession>,
}

impl RumqttTransport {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            session: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        match &self.session {
            Some(session) if session.connected.load(Ordering::Relaxed) => Ok(&session.client),
            _ => Err(TransportError::NotConnected),
        }
    }
}

fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

impl MqttTransport for RumqttTransport {
    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<(), TransportError> {
        self.disconnect();

        let mut mqtt_options = MqttOptions::new(options.client_id, options.host, options.port);
        mqtt_options.set_keep_alive(Duration::from_secs(u64::from(options.keep_alive_secs)));
        mqtt_options.set_clean_session(true);
        mqtt_options.set_last_will(LastWill::new(
            options.will.topic,
            options.will.payload.to_vec(),
            to_rumqttc_qos(options.will.qos),
            options.will.retain,
        ));

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let (inbox_tx, inbox) = mpsc::channel(MQTT_INBOX_DEPTH);

        let flag = connected.clone();
        let task = self.runtime.spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected");
                        flag.store(true, Ordering::Relaxed);
                    }
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        let inbound = InboundMessage {
                            topic: message.topic,
                            payload: message.payload.to_vec(),
                        };
                        if inbox_tx.try_send(inbound).is_err() {
                            warn!("mqtt inbox full; dropping message");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("mqtt poll error: {err}");
                        flag.store(false, Ordering::Relaxed);
                        break;
                    }
                }
            }
        });

        self.session = Some(RumqttSession {
            client,
            connected,
            inbox,
            task,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|session| {
            session.connected.load(Ordering::Relaxed) && !session.task.is_finished()
        })
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.client.try_disconnect();
            session.task.abort();
        }
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.client()?
            .try_publish(topic, to_rumqttc_qos(qos), retain, payload.to_vec())
            .map_err(|err| TransportError::Client(err.to_string()))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, to_rumqttc_qos(qos))
            .map_err(|err| TransportError::Client(err.to_string()))
    }

    fn poll_message(&mut self) -> Option<InboundMessage> {
        self.session.as_mut()?.inbox.try_recv().ok()
    }
}

struct HostPlatform;

impl Platform for HostPlatform {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn free_heap(&self) -> u32 {
        SIMULATED_FREE_HEAP
    }
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
