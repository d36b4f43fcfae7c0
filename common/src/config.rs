use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPolarity {
    ActiveHigh,
    ActiveLow,
}

impl RelayPolarity {
    /// Pin level that drives the relay into `on`.
    pub fn level_for(self, on: bool) -> bool {
        match self {
            Self::ActiveHigh => on,
            Self::ActiveLow => !on,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub switch_id: u32,
    pub state_save_cooldown_ms: u64,
    pub station_boot_timeout_ms: u64,
    pub station_poll_ms: u64,
    pub station_retry_ms: u64,
    pub station_attempt_timeout_ms: u64,
    pub ap_recovery_after_ms: u64,
    pub ap_guard_low_bytes: u32,
    pub ap_guard_high_bytes: u32,
    pub mqtt_reconnect_ms: u64,
    pub mqtt_reconnect_max_ms: u64,
    pub mqtt_connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub save_restart_delay_ms: u64,
    pub restart_delay_ms: u64,
    pub scan_cache_ms: u64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            switch_id: 1,
            state_save_cooldown_ms: 10_000,
            station_boot_timeout_ms: 10_000,
            station_poll_ms: 250,
            station_retry_ms: 15_000,
            station_attempt_timeout_ms: 10_000,
            ap_recovery_after_ms: 120_000,
            ap_guard_low_bytes: 12 * 1024,
            ap_guard_high_bytes: 20 * 1024,
            mqtt_reconnect_ms: 5_000,
            mqtt_reconnect_max_ms: 60_000,
            mqtt_connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 60_000,
            save_restart_delay_ms: 1_500,
            restart_delay_ms: 500,
            scan_cache_ms: 30_000,
        }
    }
}

impl SwitchConfig {
    pub fn sanitize(&mut self) {
        if self.switch_id == 0 {
            self.switch_id = 1;
        }
        self.station_poll_ms = self.station_poll_ms.clamp(10, 1_000);
        self.station_boot_timeout_ms = self.station_boot_timeout_ms.clamp(1_000, 30_000);
        self.station_retry_ms = self.station_retry_ms.max(1_000);
        self.station_attempt_timeout_ms = self.station_attempt_timeout_ms.max(1_000);
        self.mqtt_reconnect_ms = self.mqtt_reconnect_ms.max(500);
        self.mqtt_reconnect_max_ms = self.mqtt_reconnect_max_ms.max(self.mqtt_reconnect_ms);
        self.mqtt_connect_timeout_ms = self.mqtt_connect_timeout_ms.max(1_000);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.max(1_000);
        self.state_save_cooldown_ms = self.state_save_cooldown_ms.max(1_000);

        // Hysteresis needs a gap between the two marks.
        if self.ap_guard_high_bytes <= self.ap_guard_low_bytes {
            self.ap_guard_high_bytes = self.ap_guard_low_bytes.saturating_add(4 * 1024);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 1883,
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApConfig {
    pub ssid_prefix: String,
    pub passphrase: String,
    pub gateway: [u8; 4],
}

impl Default for ApConfig {
    fn default() -> Self {
        Self {
            ssid_prefix: "RelaySwitch".to_string(),
            passphrase: "relaysetup".to_string(),
            gateway: [192, 168, 4, 1],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayHardwareConfig {
    pub relay_pin: i32,
    pub status_led_pin: i32,
    pub polarity: RelayPolarity,
}

impl Default for RelayHardwareConfig {
    fn default() -> Self {
        Self {
            relay_pin: 12,
            status_led_pin: 13,
            polarity: RelayPolarity::ActiveHigh,
        }
    }
}

impl RelayHardwareConfig {
    pub fn sanitize(&mut self) {
        if self.relay_pin < 0 {
            self.relay_pin = 12;
        }
    }
}

/// Compiled-in configuration. The device never reads it from storage; only
/// `DeviceConfig` is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub switch: SwitchConfig,
    pub broker: BrokerConfig,
    pub access_point: ApConfig,
    #[serde(default)]
    pub relay: RelayHardwareConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.switch.sanitize();
        self.relay.sanitize();
    }
}
