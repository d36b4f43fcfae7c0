use log::info;

use crate::{
    hal::{ByteStore, RelayPin},
    relay::RelayActuator,
    store::ConfigStore,
    types::{CommandOrigin, SwitchCommand},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routed {
    pub on: bool,
    pub changed: bool,
    /// HTTP commands are republished here; MQTT commands are republished by
    /// the device after the session tick.
    pub republish: bool,
}

/// Applies commands from either surface through the same path.
pub struct CommandRouter;

impl CommandRouter {
    pub fn handle<P: RelayPin, S: ByteStore>(
        relay: &mut RelayActuator<P>,
        store: &mut ConfigStore<S>,
        command: SwitchCommand,
        origin: CommandOrigin,
        now_ms: u64,
    ) -> Routed {
        let changed = relay.apply(command.relay_on(), store, now_ms);
        if changed {
            info!("Relay {} ({origin:?})", command.as_str());
        }

        Routed {
            on: relay.is_on(),
            changed,
            republish: origin == CommandOrigin::Http,
        }
    }
}
