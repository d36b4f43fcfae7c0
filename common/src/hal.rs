//! Seams between the switch logic and the board.
//!
//! Everything behind these traits is an external collaborator: the raw
//! non-volatile store, the relay GPIO, the WiFi driver, the MQTT client and
//! the system clock. The ESP32 build binds them to ESP-IDF, the host build to
//! files, logs and `rumqttc`, and the tests to the fakes in `testing`.

use thiserror::Error;

use crate::types::ScanEntry;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage write of {len} bytes at {offset} exceeds capacity {capacity}")]
    OutOfRange {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("{field} does not fit the radio configuration")]
    InvalidSetting { field: &'static str },
    #[error("wifi driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mqtt connect failed: {0}")]
    Connect(String),
    #[error("mqtt client is not connected")]
    NotConnected,
    #[error("mqtt client error: {0}")]
    Client(String),
}

/// Byte-addressable non-volatile storage with an explicit commit.
///
/// Writes are staged until `commit`; a power cut before commit must leave the
/// previously committed bytes in place.
pub trait ByteStore {
    fn capacity(&self) -> usize;
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
}

/// The relay output. Infallible once the GPIO is configured.
pub trait RelayPin {
    fn set_level(&mut self, high: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationCredentials {
    pub ssid: String,
    pub passphrase: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String,
    pub passphrase: String,
    pub gateway: [u8; 4],
}

pub trait WifiRadio {
    /// Applies the radio mode. `None` on either side turns that side off.
    /// Toggling the access point must not drop an established station link
    /// when the station settings are unchanged.
    fn configure(
        &mut self,
        station: Option<&StationCredentials>,
        access_point: Option<&AccessPointSettings>,
    ) -> Result<(), RadioError>;

    /// Starts association with the configured station network and returns
    /// without waiting for the outcome.
    fn connect_station(&mut self) -> Result<(), RadioError>;

    fn station_connected(&self) -> bool;

    fn start_scan(&mut self) -> Result<(), RadioError>;

    /// Finished scan results, or `None` while the scan is still running.
    fn scan_results(&mut self) -> Option<Vec<ScanEntry>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct SessionOptions<'a> {
    pub client_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub keep_alive_secs: u16,
    pub will: LastWill<'a>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A broker connection. No method may block beyond a short bounded time.
pub trait MqttTransport {
    /// Opens a new session. It may complete later; `is_connected` reports it.
    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn disconnect(&mut self);
    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), TransportError>;
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;
    fn poll_message(&mut self) -> Option<InboundMessage>;
}

/// Monotonic time, bounded sleeping and heap telemetry.
pub trait Platform {
    fn now_ms(&self) -> u64;
    fn delay_ms(&self, ms: u64);
    fn free_heap(&self) -> u32;
}
