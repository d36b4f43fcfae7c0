use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS as MqttQoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    mqtt::client::{EspMqttClient, LwtConfiguration, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys::EspError,
    wifi::{config::ScanConfig, EspWifi},
};
use log::{info, warn};

use relayswitch_common::{
    mqtt::MAX_PAYLOAD_BYTES, AccessPointSettings, ByteStore, CommandReply, ConfigForm,
    ConnectivityState, DeviceIdentity, HttpRequest, HttpResponse, HttpSurface, InboundMessage,
    MqttSessionState, MqttTransport, Platform, QoS, RadioError, RelayPin, RuntimeConfig,
    ScanEntry, SessionOptions, StationCredentials, StorageError, SwitchDevice, Tick,
    TransportError, WifiRadio, RECORD_LEN,
};

const NVS_NAMESPACE: &str = "relayswitch";
const NVS_RECORD_KEY: &str = "record";
const MAX_HTTP_BODY: usize = 1024;
const REQUEST_QUEUE_DEPTH: usize = 8;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_INBOX_DEPTH: usize = 16;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const LOOP_INTERVAL: Duration = Duration::from_millis(20);
const LED_FAST_BLINK_MS: u64 = 200;
const LED_SLOW_BLINK_MS: u64 = 900;

const INDEX_HTML: &str = include_str!("../web/index.html");

struct PendingRequest {
    request: HttpRequest,
    reply: mpsc::SyncSender<HttpResponse>,
}

/// Drains requests parked by the httpd handlers.
struct QueuedRequests {
    rx: mpsc::Receiver<PendingRequest>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut runtime = RuntimeConfig::default();
    apply_build_overrides(&mut runtime);
    runtime.sanitize();

    info!(
        "switch {} starting: relay=GPIO{} mqtt=`{}:{}`",
        runtime.switch.switch_id,
        runtime.relay.relay_pin,
        runtime.broker.host,
        runtime.broker.port,
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let device_loop = thread::Builder::new()
        .name("device-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = run_device(runtime, modem, sys_loop, nvs_partition) {
                warn!("device loop failed: {err:#}; restarting");
                thread::sleep(Duration::from_secs(1));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
        })
        .context("failed to spawn device loop")?;

    device_loop
        .join()
        .map_err(|_| anyhow!("device loop panicked"))
}

fn apply_build_overrides(runtime: &mut RuntimeConfig) {
    if let Some(host) = option_env!("MQTT_HOST") {
        runtime.broker.host = host.to_string();
    }
    if let Some(port) = option_env!("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.broker.port = port;
    }
}

fn run_device(
    runtime: RuntimeConfig,
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<()> {
    let storage = NvsByteStore::open(nvs_partition.clone())?;
    let pin = GpioRelayPin::new(
        runtime.relay.relay_pin,
        runtime.relay.polarity.level_for(false),
    )?;
    let radio = EspRadio::new(modem, sys_loop, nvs_partition, runtime.access_point.gateway)?;
    let identity = DeviceIdentity::from_mac(radio.mac()?);
    info!("chip id {}", identity.chip_id());

    let (queue, rx) = mpsc::sync_channel(REQUEST_QUEUE_DEPTH);
    let _server = create_http_server(queue)?;
    let mut surface = QueuedRequests { rx };

    let status_led_pin = runtime.relay.status_led_pin;
    let mut device = SwitchDevice::new(
        runtime,
        &identity,
        storage,
        pin,
        radio,
        EspMqttTransport::default(),
        EspPlatform,
    );

    device.boot(&mut surface);
    disable_wifi_power_save();
    info!(
        "switch booted: hostname=`{}` wifi={} ap=`{}`",
        device.device_config().hostname,
        device.connectivity_state().as_str(),
        device.access_point_ssid(),
    );

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register device loop with watchdog: {err:#}");
    }
    let mut status_led = init_status_led(status_led_pin);

    loop {
        feed_watchdog();
        if device.tick(&mut surface) == Tick::Restart {
            info!("restarting");
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        update_status_led(
            &mut status_led,
            device.connectivity_state(),
            device.mqtt_state(),
            monotonic_ms(),
        );
        thread::sleep(LOOP_INTERVAL);
    }
}

fn create_http_server(
    queue: mpsc::SyncSender<PendingRequest>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    // Captive-portal connectivity checks land on the control page.
    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let queue = queue.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            write_response(req, dispatch(&queue, HttpRequest::Status))
        })?;
    }

    {
        let queue = queue.clone();
        server.fn_handler("/api/switch", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(token) = query_param(&uri, "state") else {
                return write_response(
                    req,
                    HttpResponse::error(400, "Missing 'state' parameter"),
                );
            };
            let request = HttpRequest::Command {
                token,
                reply: CommandReply::Json,
            };
            write_response(req, dispatch(&queue, request))
        })?;
    }

    for (path, token) in [("/on", "on"), ("/off", "off")] {
        let queue = queue.clone();
        server.fn_handler(path, Method::Get, move |req| {
            let request = HttpRequest::Command {
                token: token.to_string(),
                reply: CommandReply::Redirect,
            };
            write_response(req, dispatch(&queue, request))
        })?;
    }

    {
        let queue = queue.clone();
        server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = ConfigForm::from_urlencoded(&String::from_utf8_lossy(&body));
            write_response(req, dispatch(&queue, HttpRequest::SaveConfig(form)))
        })?;
    }

    {
        let queue = queue.clone();
        server.fn_handler("/api/restart", Method::Post, move |req| {
            write_response(req, dispatch(&queue, HttpRequest::Restart))
        })?;
    }

    server.fn_handler("/api/scan", Method::Get, move |req| {
        write_response(req, dispatch(&queue, HttpRequest::Scan))
    })?;

    Ok(server)
}

/// Parks `request` for the device loop and waits for its answer.
fn dispatch(queue: &mpsc::SyncSender<PendingRequest>, request: HttpRequest) -> HttpResponse {
    let (reply, response) = mpsc::sync_channel(1);
    if queue.try_send(PendingRequest { request, reply }).is_err() {
        return HttpResponse::error(503, "Device is busy");
    }
    response
        .recv_timeout(REQUEST_TIMEOUT)
        .unwrap_or_else(|_| HttpResponse::error(503, "Device loop did not answer"))
}

impl HttpSurface for QueuedRequests {
    fn serve(&mut self, handler: &mut dyn FnMut(HttpRequest) -> HttpResponse) {
        while let Ok(pending) = self.rx.try_recv() {
            let response = handler(pending.request);
            let _ = pending.reply.try_send(response);
        }
    }
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: HttpResponse,
) -> anyhow::Result<()> {
    let mut headers = vec![("Content-Type", response.content_type)];
    if let Some(location) = response.location {
        headers.push(("Location", location));
    }
    req.into_response(response.status, None, &headers)?
        .write_all(response.body.as_bytes())?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(value.replace('+', " "));
        }
    }

    None
}

/// RAM image of the record, written to NVS as one blob on commit.
struct NvsByteStore {
    nvs: EspNvs<NvsDefault>,
    image: Vec<u8>,
}

impl NvsByteStore {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .context("failed to open NVS namespace")?;
        let mut image = vec![0xFF_u8; RECORD_LEN];
        let mut buffer = vec![0_u8; RECORD_LEN];

        match nvs.get_raw(NVS_RECORD_KEY, &mut buffer) {
            Ok(Some(stored)) => {
                let len = stored.len().min(image.len());
                image[..len].copy_from_slice(&stored[..len]);
            }
            Ok(None) => info!("no stored record"),
            Err(err) => warn!("failed to read stored record: {err}"),
        }

        Ok(Self { nvs, image })
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

impl ByteStore for NvsByteStore {
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
        self.nvs
            .set_raw(NVS_RECORD_KEY, &self.image)
            .map(|_| ())
            .map_err(|err| StorageError::Backend(err.to_string()))
    }
}

struct GpioRelayPin {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioRelayPin {
    fn new(gpio: i32, initial_high: bool) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::output(AnyOutputPin::new(gpio)) }
            .with_context(|| format!("failed to claim relay GPIO{gpio}"))?;
        if initial_high {
            pin.set_high()?;
        } else {
            pin.set_low()?;
        }
        Ok(Self { pin })
    }
}

impl RelayPin for GpioRelayPin {
    fn set_level(&mut self, high: bool) {
        let result = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive relay pin: {err}");
        }
    }
}

struct EspRadio {
    wifi: EspWifi<'static>,
    station: Option<StationCredentials>,
}

impl EspRadio {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        gateway: [u8; 4],
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
        wifi.swap_netif_ap(build_ap_netif(gateway)?)
            .context("failed to apply access point netif configuration")?;
        Ok(Self {
            wifi,
            station: None,
        })
    }

    fn mac(&self) -> anyhow::Result<[u8; 6]> {
        Ok(self.wifi.sta_netif().get_mac()?)
    }
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn build_ap_netif(gateway: [u8; 4]) -> anyhow::Result<EspNetif> {
    let gateway = ipv4_from_octets(gateway);
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
            subnet: Subnet {
                gateway,
                mask: Mask(24),
            },
            dhcp_enabled: true,
            dns: Some(gateway),
            secondary_dns: None,
        })),
        ..NetifConfiguration::wifi_default_router()
    };

    Ok(EspNetif::new_with_conf(&conf)?)
}

fn driver_error(err: EspError) -> RadioError {
    RadioError::Driver(err.to_string())
}

fn client_configuration(station: &StationCredentials) -> Result<ClientConfiguration, RadioError> {
    let auth_method = if station.passphrase.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    Ok(ClientConfiguration {
        ssid: station
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| RadioError::InvalidSetting { field: "ssid" })?,
        password: station
            .passphrase
            .as_str()
            .try_into()
            .map_err(|_| RadioError::InvalidSetting { field: "passphrase" })?,
        auth_method,
        ..Default::default()
    })
}

fn access_point_configuration(
    ap: &AccessPointSettings,
) -> Result<AccessPointConfiguration, RadioError> {
    Ok(AccessPointConfiguration {
        ssid: ap
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| RadioError::InvalidSetting { field: "ap ssid" })?,
        password: ap
            .passphrase
            .as_str()
            .try_into()
            .map_err(|_| RadioError::InvalidSetting {
                field: "ap passphrase",
            })?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        max_connections: 4,
        ..Default::default()
    })
}

impl WifiRadio for EspRadio {
    fn configure(
        &mut self,
        station: Option<&StationCredentials>,
        access_point: Option<&AccessPointSettings>,
    ) -> Result<(), RadioError> {
        let client = station.map(client_configuration).transpose()?;
        let ap = access_point.map(access_point_configuration).transpose()?;

        // AP-only still carries an idle station interface so scans work.
        let configuration = match (client, ap) {
            (Some(client), Some(ap)) => Configuration::Mixed(client, ap),
            (Some(client), None) => Configuration::Client(client),
            (None, Some(ap)) => Configuration::Mixed(ClientConfiguration::default(), ap),
            (None, None) => Configuration::None,
        };

        // Only a station change restarts the driver; AP toggles apply live.
        let station_changed = self.station.as_ref() != station;
        let started = self.wifi.is_started().map_err(driver_error)?;
        if started && station_changed {
            self.wifi.stop().map_err(driver_error)?;
        }
        self.wifi
            .set_configuration(&configuration)
            .map_err(driver_error)?;
        if let Some(station) = station.filter(|_| station_changed) {
            self.wifi
                .sta_netif_mut()
                .set_hostname(&station.hostname)
                .map_err(driver_error)?;
        }
        if !matches!(configuration, Configuration::None)
            && !self.wifi.is_started().map_err(driver_error)?
        {
            self.wifi.start().map_err(driver_error)?;
        }
        self.station = station.cloned();
        Ok(())
    }

    fn connect_station(&mut self) -> Result<(), RadioError> {
        self.wifi.connect().map_err(driver_error)
    }

    fn station_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        self.wifi
            .start_scan(&ScanConfig::default(), false)
            .map_err(driver_error)
    }

    fn scan_results(&mut self) -> Option<Vec<ScanEntry>> {
        match self.wifi.is_scan_done() {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!("wifi scan failed: {err}");
                return Some(Vec::new());
            }
        }

        let networks = match self.wifi.get_scan_result() {
            Ok(networks) => networks,
            Err(err) => {
                warn!("failed to read scan results: {err}");
                return Some(Vec::new());
            }
        };
        Some(
            networks
                .into_iter()
                .map(|network| ScanEntry {
                    ssid: network.ssid.to_string(),
                    rssi: network.signal_strength,
                    secured: !matches!(network.auth_method, None | Some(AuthMethod::None)),
                })
                .collect(),
        )
    }
}

struct EspMqttSession {
    client: EspMqttClient<'static>,
    connected: Arc<AtomicBool>,
    inbox: mpsc::Receiver<InboundMessage>,
}

/// One `EspMqttClient` per session. Dropping the client closes it.
#[derive(Default)]
struct EspMqttTransport {
    session: Option<EspMqttSession>,
}

impl EspMqttTransport {
    fn session(&mut self) -> Result<&mut EspMqttSession, TransportError> {
        match self.session.as_mut() {
            Some(session) if session.connected.load(Ordering::Relaxed) => Ok(session),
            _ => Err(TransportError::NotConnected),
        }
    }
}

fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
    }
}

impl MqttTransport for EspMqttTransport {
    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<(), TransportError> {
        self.disconnect();

        let url = format!("mqtt://{}:{}", options.host, options.port);
        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id),
            keep_alive_interval: Some(Duration::from_secs(u64::from(options.keep_alive_secs))),
            lwt: Some(LwtConfiguration {
                topic: options.will.topic,
                payload: options.will.payload,
                qos: to_mqtt_qos(options.will.qos),
                retain: options.will.retain,
            }),
            ..Default::default()
        };

        let connected = Arc::new(AtomicBool::new(false));
        let (inbox_tx, inbox) = mpsc::sync_channel(MQTT_INBOX_DEPTH);
        let flag = connected.clone();

        let client = EspMqttClient::new_cb(&url, &conf, move |event| match event.payload() {
            EventPayload::Connected(_) => {
                info!("mqtt connected");
                flag.store(true, Ordering::Relaxed);
            }
            EventPayload::Disconnected => flag.store(false, Ordering::Relaxed),
            EventPayload::Received {
                topic: Some(topic),
                data,
                details,
                ..
            } => {
                // We only process full MQTT payloads.
                if !matches!(details, Details::Complete) {
                    return;
                }
                if data.len() > MAX_PAYLOAD_BYTES {
                    warn!(
                        "dropping oversized MQTT payload on topic {} ({} bytes)",
                        topic,
                        data.len()
                    );
                    return;
                }
                let message = InboundMessage {
                    topic: topic.to_string(),
                    payload: data.to_vec(),
                };
                if inbox_tx.try_send(message).is_err() {
                    warn!("mqtt inbox full; dropping message on {topic}");
                }
            }
            _ => {}
        })
        .map_err(|err| TransportError::Connect(err.to_string()))?;

        self.session = Some(EspMqttSession {
            client,
            connected,
            inbox,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.connected.load(Ordering::Relaxed))
    }

    fn disconnect(&mut self) {
        self.session = None;
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.session()?
            .client
            .enqueue(topic, to_mqtt_qos(qos), retain, payload)
            .map(|_| ())
            .map_err(|err| TransportError::Client(err.to_string()))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.session()?
            .client
            .subscribe(topic, to_mqtt_qos(qos))
            .map(|_| ())
            .map_err(|err| TransportError::Client(err.to_string()))
    }

    fn poll_message(&mut self) -> Option<InboundMessage> {
        self.session.as_ref()?.inbox.try_recv().ok()
    }
}

struct EspPlatform;

impl Platform for EspPlatform {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn free_heap(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
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

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    if pin < 0 {
        return None;
    }
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

/// Fast blink without a station link, slow blink without a broker, solid
/// when both are up.
fn update_status_led(
    status_led: &mut Option<StatusLed>,
    wifi: ConnectivityState,
    mqtt: MqttSessionState,
    now_ms: u64,
) {
    let station_up = matches!(
        wifi,
        ConnectivityState::StationConnected | ConnectivityState::DualMode
    );
    let desired_on = if !station_up {
        ((now_ms / LED_FAST_BLINK_MS) % 2) == 0
    } else if mqtt != MqttSessionState::Connected {
        ((now_ms / LED_SLOW_BLINK_MS) % 2) == 0
    } else {
        true
    };

    let Some(led) = status_led.as_mut() else {
        return;
    };

    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
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
