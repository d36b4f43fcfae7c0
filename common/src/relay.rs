use log::{info, warn};

use crate::{
    config::RelayPolarity,
    hal::{ByteStore, RelayPin},
    store::{ConfigStore, WriteOutcome},
};

/// Sole owner of the relay output and its logical state.
pub struct RelayActuator<P> {
    pin: P,
    polarity: RelayPolarity,
    on: bool,
}

impl<P: RelayPin> RelayActuator<P> {
    /// Takes the pin and drives it off before anything else runs.
    pub fn new(mut pin: P, polarity: RelayPolarity) -> Self {
        pin.set_level(polarity.level_for(false));
        Self {
            pin,
            polarity,
            on: false,
        }
    }

    /// Drives the pin to the persisted state without a persistence write.
    pub fn restore<S: ByteStore>(&mut self, store: &ConfigStore<S>) {
        self.drive(store.config().relay_on);
        info!("Relay restored {}", if self.on { "on" } else { "off" });
    }

    /// Returns whether the logical state changed. Re-applying the current
    /// state still rewrites the pin and goes through the throttled save.
    pub fn apply<S: ByteStore>(&mut self, on: bool, store: &mut ConfigStore<S>, now_ms: u64) -> bool {
        let changed = self.on != on;
        self.drive(on);

        match store.save_state(on, now_ms) {
            Ok(WriteOutcome::Written) | Ok(WriteOutcome::Throttled) => {}
            Err(err) => warn!("Relay state not persisted: {err}"),
        }

        changed
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    fn drive(&mut self, on: bool) {
        self.pin.set_level(self.polarity.level_for(on));
        self.on = on;
    }
}
