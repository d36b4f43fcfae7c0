use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchCommand {
    On,
    Off,
}

impl SwitchCommand {
    /// Exact, case-sensitive token match.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    pub fn relay_on(self) -> bool {
        matches!(self, Self::On)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrigin {
    Http,
    Mqtt,
}

pub fn state_token(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    ConnectingStation,
    StationConnected,
    AccessPointOnly,
    DualMode,
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::ConnectingStation => "connecting",
            Self::StationConnected => "station",
            Self::AccessPointOnly => "access_point",
            Self::DualMode => "dual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttSessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl MqttSessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Hardware-derived identity. Stable across reboots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    chip_id: String,
}

impl DeviceIdentity {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self {
            chip_id: format!("{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5]),
        }
    }

    pub fn chip_id(&self) -> &str {
        &self.chip_id
    }

    pub fn default_hostname(&self) -> String {
        format!("relay-{}", self.chip_id)
    }

    pub fn client_id(&self) -> String {
        format!("relay-{}", self.chip_id)
    }

    pub fn access_point_ssid(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.chip_id.to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
    pub ssid: String,
    pub rssi: i8,
    pub secured: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchStatePayload {
    pub switch: u32,
    pub state: &'static str,
    pub uptime: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub id: String,
    pub uptime: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub switch: u32,
    pub state: &'static str,
    pub hostname: String,
    pub ssid: String,
    pub wifi: &'static str,
    pub mqtt: &'static str,
    #[serde(rename = "apFallback")]
    pub ap_fallback: bool,
    #[serde(rename = "apGuarded")]
    pub ap_guarded: bool,
    #[serde(rename = "freeHeap")]
    pub free_heap: u32,
    pub uptime: u64,
    #[serde(rename = "restartPending")]
    pub restart_pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tokens_are_case_sensitive() {
        assert_eq!(SwitchCommand::from_token("on"), Some(SwitchCommand::On));
        assert_eq!(SwitchCommand::from_token("off"), Some(SwitchCommand::Off));
        assert_eq!(SwitchCommand::from_token("ON"), None);
        assert_eq!(SwitchCommand::from_token("toggle"), None);
        assert_eq!(SwitchCommand::from_token(" on"), None);
    }

    #[test]
    fn identity_derives_names_from_mac_tail() {
        let identity = DeviceIdentity::from_mac([0x24, 0x0a, 0xc4, 0x1b, 0x2c, 0xfe]);

        assert_eq!(identity.chip_id(), "1b2cfe");
        assert_eq!(identity.default_hostname(), "relay-1b2cfe");
        assert_eq!(identity.client_id(), "relay-1b2cfe");
        assert_eq!(identity.access_point_ssid("RelaySwitch"), "RelaySwitch-1B2CFE");
    }
}
