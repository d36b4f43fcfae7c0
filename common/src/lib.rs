pub mod config;
pub mod connectivity;
pub mod device;
pub mod hal;
pub mod http;
pub mod mqtt;
pub mod record;
pub mod relay;
pub mod router;
pub mod store;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{ApConfig, BrokerConfig, RelayPolarity, RuntimeConfig, SwitchConfig};
pub use device::{SwitchDevice, Tick};
pub use hal::{
    AccessPointSettings, ByteStore, InboundMessage, MqttTransport, Platform, QoS, RadioError,
    RelayPin, SessionOptions, StationCredentials, StorageError, TransportError, WifiRadio,
};
pub use http::{CommandReply, ConfigForm, HttpRequest, HttpResponse, HttpSurface};
pub use record::{DeviceConfig, RECORD_LEN};
pub use topics::*;
pub use types::{ConnectivityState, DeviceIdentity, MqttSessionState, ScanEntry, SwitchCommand};
