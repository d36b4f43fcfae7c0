//! The switch as one owned context, advanced by a single cooperative tick.

use log::{info, warn};
use serde::Serialize;

use crate::{
    config::{RuntimeConfig, SwitchConfig},
    connectivity::ConnectivityManager,
    hal::{AccessPointSettings, ByteStore, MqttTransport, Platform, RelayPin, WifiRadio},
    http::{save_ack_page, CommandReply, ConfigForm, HttpRequest, HttpResponse, HttpSurface},
    mqtt::MqttSession,
    record::DeviceConfig,
    relay::RelayActuator,
    router::CommandRouter,
    store::ConfigStore,
    types::{
        state_token, CommandOrigin, ConnectivityState, DeviceIdentity, DeviceStatus,
        MqttSessionState, ScanEntry, SwitchCommand,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    /// A restart was requested and its delay has passed.
    Restart,
}

#[derive(Debug, Serialize)]
struct RestartResponse {
    restarting: bool,
}

#[derive(Debug, Serialize)]
struct ScanResponse<'a> {
    scanning: bool,
    networks: &'a [ScanEntry],
}

/// Everything an HTTP request may touch. Kept apart from the radio so the
/// boot wait can answer requests while it owns the radio.
struct DeviceCore<S, P> {
    store: ConfigStore<S>,
    relay: RelayActuator<P>,
    mqtt: MqttSession,
    config: SwitchConfig,
    restart_at_ms: Option<u64>,
    scan_requested: bool,
}

impl<S: ByteStore, P: RelayPin> DeviceCore<S, P> {
    fn handle_http<T: MqttTransport>(
        &mut self,
        request: HttpRequest,
        transport: &mut T,
        network: &ConnectivityManager,
        now_ms: u64,
        free_heap: u32,
    ) -> HttpResponse {
        match request {
            HttpRequest::Status => HttpResponse::json(200, &self.status(network, now_ms, free_heap)),
            HttpRequest::Command { token, reply } => {
                let Some(command) = SwitchCommand::from_token(&token) else {
                    return HttpResponse::error(400, "Invalid state. Use 'on' or 'off'");
                };
                let routed = CommandRouter::handle(
                    &mut self.relay,
                    &mut self.store,
                    command,
                    CommandOrigin::Http,
                    now_ms,
                );
                if routed.republish {
                    self.mqtt.publish_state(transport, routed.on, now_ms);
                }
                match reply {
                    CommandReply::Json => {
                        HttpResponse::json(200, &self.status(network, now_ms, free_heap))
                    }
                    CommandReply::Redirect => HttpResponse::redirect("/"),
                }
            }
            HttpRequest::SaveConfig(form) => self.save_config(&form, now_ms),
            HttpRequest::Restart => {
                self.schedule_restart(now_ms, self.config.restart_delay_ms);
                HttpResponse::json(200, &RestartResponse { restarting: true })
            }
            HttpRequest::Scan => {
                self.scan_requested = true;
                HttpResponse::json(
                    200,
                    &ScanResponse {
                        scanning: network.scan_pending(),
                        networks: network.scan_results(),
                    },
                )
            }
        }
    }

    fn save_config(&mut self, form: &ConfigForm, now_ms: u64) -> HttpResponse {
        let update = match form.validate() {
            Ok(update) => update,
            Err(err) => return HttpResponse::error(400, &err.to_string()),
        };

        if let Err(err) = self.store.save_wifi(&update) {
            warn!("Failed to save wifi settings: {err}");
            return HttpResponse::error(500, "Failed to save settings");
        }

        let delay_ms = self.config.save_restart_delay_ms;
        self.schedule_restart(now_ms, delay_ms);
        let config = self.store.config();
        HttpResponse::html(200, save_ack_page(&config.ssid, &config.hostname, delay_ms))
    }

    /// Restarts cannot be cancelled; a later request never pushes an earlier
    /// deadline back.
    fn schedule_restart(&mut self, now_ms: u64, delay_ms: u64) {
        let at = now_ms.saturating_add(delay_ms);
        let at = self.restart_at_ms.map_or(at, |pending| pending.min(at));
        info!("Restart scheduled in {} ms", at.saturating_sub(now_ms));
        self.restart_at_ms = Some(at);
    }

    fn status(&self, network: &ConnectivityManager, now_ms: u64, free_heap: u32) -> DeviceStatus {
        let config = self.store.config();
        DeviceStatus {
            switch: self.config.switch_id,
            state: state_token(self.relay.is_on()),
            hostname: config.hostname.clone(),
            ssid: config.ssid.clone(),
            wifi: network.state().as_str(),
            mqtt: self.mqtt.state().as_str(),
            ap_fallback: config.ap_fallback,
            ap_guarded: network.ap_guarded(),
            free_heap,
            uptime: now_ms / 1000,
            restart_pending: self.restart_at_ms.is_some(),
        }
    }
}

pub struct SwitchDevice<S, P, R, T, C> {
    core: DeviceCore<S, P>,
    connectivity: ConnectivityManager,
    radio: R,
    transport: T,
    platform: C,
}

impl<S, P, R, T, C> SwitchDevice<S, P, R, T, C>
where
    S: ByteStore,
    P: RelayPin,
    R: WifiRadio,
    T: MqttTransport,
    C: Platform,
{
    /// Drives the relay off, loads the record and restores the persisted
    /// relay state. Nothing touches the network until `boot`.
    pub fn new(
        mut runtime: RuntimeConfig,
        identity: &DeviceIdentity,
        storage: S,
        pin: P,
        radio: R,
        transport: T,
        platform: C,
    ) -> Self {
        runtime.sanitize();

        let mut relay = RelayActuator::new(pin, runtime.relay.polarity);
        let store = ConfigStore::load(storage, identity, runtime.switch.state_save_cooldown_ms);
        relay.restore(&store);

        let access_point = AccessPointSettings {
            ssid: identity.access_point_ssid(&runtime.access_point.ssid_prefix),
            passphrase: runtime.access_point.passphrase.clone(),
            gateway: runtime.access_point.gateway,
        };
        let connectivity = ConnectivityManager::new(&runtime.switch, store.config(), access_point);
        let mqtt = MqttSession::new(identity.client_id(), runtime.broker, &runtime.switch);

        Self {
            core: DeviceCore {
                store,
                relay,
                mqtt,
                config: runtime.switch,
                restart_at_ms: None,
                scan_requested: false,
            },
            connectivity,
            radio,
            transport,
            platform,
        }
    }

    /// Brings WiFi up. With stored credentials this waits for the station up
    /// to the boot timeout, answering HTTP requests between polls.
    pub fn boot<H: HttpSurface>(&mut self, surface: &mut H) {
        let waiting = self
            .connectivity
            .begin(&mut self.radio, self.platform.now_ms());

        let connected = waiting && {
            let core = &mut self.core;
            let transport = &mut self.transport;
            let platform = &self.platform;
            self.connectivity
                .wait_for_station(platform, &mut self.radio, |network| {
                    let now_ms = platform.now_ms();
                    let free_heap = platform.free_heap();
                    surface.serve(&mut |request| {
                        core.handle_http(request, transport, network, now_ms, free_heap)
                    });
                })
        };

        self.connectivity.finish_boot(
            &mut self.radio,
            connected,
            self.platform.free_heap(),
            self.platform.now_ms(),
        );
    }

    /// One pass of the cooperative loop. Never blocks.
    pub fn tick<H: HttpSurface>(&mut self, surface: &mut H) -> Tick {
        let now_ms = self.platform.now_ms();
        let free_heap = self.platform.free_heap();

        {
            let core = &mut self.core;
            let transport = &mut self.transport;
            let network = &self.connectivity;
            surface.serve(&mut |request| {
                core.handle_http(request, transport, network, now_ms, free_heap)
            });
        }

        if std::mem::take(&mut self.core.scan_requested) {
            self.connectivity.request_scan(&mut self.radio, now_ms);
        }

        self.connectivity.tick(&mut self.radio, free_heap, now_ms);

        let core = &mut self.core;
        let commands = core.mqtt.tick(
            &mut self.transport,
            self.connectivity.station_connected(),
            core.relay.is_on(),
            now_ms,
        );
        for command in commands {
            CommandRouter::handle(
                &mut core.relay,
                &mut core.store,
                command,
                CommandOrigin::Mqtt,
                now_ms,
            );
            core.mqtt
                .publish_state(&mut self.transport, core.relay.is_on(), now_ms);
        }

        if let Err(err) = core.store.flush_pending(now_ms) {
            warn!("Deferred relay state write failed: {err}");
        }

        match core.restart_at_ms {
            Some(at) if now_ms >= at => {
                if let Err(err) = core.store.flush_pending_now(now_ms) {
                    warn!("Relay state not persisted before restart: {err}");
                }
                info!("Restarting");
                Tick::Restart
            }
            _ => Tick::Continue,
        }
    }

    pub fn relay_on(&self) -> bool {
        self.core.relay.is_on()
    }

    pub fn device_config(&self) -> &DeviceConfig {
        self.core.store.config()
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.connectivity.state()
    }

    pub fn mqtt_state(&self) -> MqttSessionState {
        self.core.mqtt.state()
    }

    pub fn restart_pending(&self) -> bool {
        self.core.restart_at_ms.is_some()
    }

    pub fn access_point_ssid(&self) -> &str {
        self.connectivity.access_point_ssid()
    }
}
