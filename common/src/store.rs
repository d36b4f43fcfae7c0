use log::{info, warn};

use crate::{
    hal::{ByteStore, StorageError},
    record::{encode_flag, encode_slot, DeviceConfig, Field, RECORD_LEN},
    types::DeviceIdentity,
};

/// Rate limit for one persisted quantity.
#[derive(Debug, Clone, Copy)]
pub struct WriteThrottle {
    cooldown_ms: u64,
    last_write_ms: Option<u64>,
}

impl WriteThrottle {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            cooldown_ms,
            last_write_ms: None,
        }
    }

    pub fn allows(&self, now_ms: u64) -> bool {
        match self.last_write_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.cooldown_ms,
            None => true,
        }
    }

    pub fn record(&mut self, now_ms: u64) {
        self.last_write_ms = Some(now_ms);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Throttled,
}

/// A configuration save. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiUpdate {
    pub ssid: String,
    pub passphrase: Option<String>,
    pub hostname: Option<String>,
    pub ap_fallback: Option<bool>,
}

/// In-memory mirror of the persisted record plus the storage it came from.
///
/// Relay state writes are throttled to spare flash endurance. A toggle inside
/// the cooldown is held as a pending write and reaches storage through
/// [`ConfigStore::flush_pending`] once the cooldown has run out; a power cut
/// before then restores the previous state. Configuration saves are never
/// throttled.
pub struct ConfigStore<S> {
    storage: S,
    config: DeviceConfig,
    state_throttle: WriteThrottle,
    stored_relay_on: bool,
    pending_state: Option<bool>,
}

impl<S: ByteStore> ConfigStore<S> {
    pub fn load(storage: S, identity: &DeviceIdentity, state_cooldown_ms: u64) -> Self {
        let mut store = Self {
            storage,
            config: DeviceConfig::defaults(identity),
            state_throttle: WriteThrottle::new(state_cooldown_ms),
            stored_relay_on: false,
            pending_state: None,
        };

        match store.read_record() {
            Some(config) => {
                info!(
                    "Loaded config: hostname={}, ssid={:?}, relay={}",
                    config.hostname,
                    config.ssid,
                    if config.relay_on { "on" } else { "off" }
                );
                store.stored_relay_on = config.relay_on;
                store.config = config;
            }
            None => {
                info!("No valid config record, writing defaults");
                if let Err(err) = store.write_initial() {
                    warn!("Failed to persist default config: {err}");
                }
            }
        }

        store
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Records the relay state, writing it through unless the cooldown since
    /// the last state write is still running. A throttled state that differs
    /// from storage is kept pending for [`ConfigStore::flush_pending`].
    pub fn save_state(&mut self, on: bool, now_ms: u64) -> Result<WriteOutcome, StorageError> {
        self.config.relay_on = on;

        if !self.state_throttle.allows(now_ms) {
            self.pending_state = (on != self.stored_relay_on).then_some(on);
            return Ok(WriteOutcome::Throttled);
        }

        self.write_state(on, now_ms)?;
        Ok(WriteOutcome::Written)
    }

    pub fn has_pending_state(&self) -> bool {
        self.pending_state.is_some()
    }

    /// Writes a deferred relay state once the cooldown allows it. Returns
    /// whether anything was written. A failed write waits another cooldown
    /// before it is retried.
    pub fn flush_pending(&mut self, now_ms: u64) -> Result<bool, StorageError> {
        let Some(on) = self.pending_state else {
            return Ok(false);
        };
        if !self.state_throttle.allows(now_ms) {
            return Ok(false);
        }

        if let Err(err) = self.write_state(on, now_ms) {
            self.state_throttle.record(now_ms);
            return Err(err);
        }
        info!("Persisted deferred relay state: {}", if on { "on" } else { "off" });
        Ok(true)
    }

    /// Writes a deferred relay state regardless of the cooldown, for use right
    /// before a controlled restart.
    pub fn flush_pending_now(&mut self, now_ms: u64) -> Result<bool, StorageError> {
        let Some(on) = self.pending_state else {
            return Ok(false);
        };
        self.write_state(on, now_ms)?;
        Ok(true)
    }

    pub fn save_wifi(&mut self, update: &WifiUpdate) -> Result<(), StorageError> {
        self.config.ssid = update.ssid.clone();
        if let Some(passphrase) = &update.passphrase {
            self.config.passphrase = passphrase.clone();
        }
        if let Some(hostname) = &update.hostname {
            self.config.hostname = hostname.clone();
        }
        if let Some(ap_fallback) = update.ap_fallback {
            self.config.ap_fallback = ap_fallback;
        }

        self.write_slot(Field::Ssid, &update.ssid)?;
        if let Some(passphrase) = &update.passphrase {
            self.write_slot(Field::Passphrase, passphrase)?;
        }
        if let Some(hostname) = &update.hostname {
            self.write_slot(Field::Hostname, hostname)?;
        }
        if let Some(ap_fallback) = update.ap_fallback {
            self.storage
                .write(Field::ApFallback.offset(), &[encode_flag(ap_fallback)])?;
        }
        self.storage.commit()?;

        info!("Saved wifi config: ssid={:?}", self.config.ssid);
        Ok(())
    }

    // Stays pending until the commit succeeds.
    fn write_state(&mut self, on: bool, now_ms: u64) -> Result<(), StorageError> {
        self.pending_state = Some(on);
        self.storage
            .write(Field::RelayState.offset(), &[encode_flag(on)])?;
        self.storage.commit()?;
        self.state_throttle.record(now_ms);
        self.stored_relay_on = on;
        self.pending_state = None;
        Ok(())
    }

    fn read_record(&self) -> Option<DeviceConfig> {
        let mut bytes = [0_u8; RECORD_LEN];
        if let Err(err) = self.storage.read(0, &mut bytes) {
            warn!("Config read failed, treating record as invalid: {err}");
            return None;
        }
        DeviceConfig::from_bytes(&bytes)
    }

    // Marker goes last so an interrupted init is detected on the next boot.
    fn write_initial(&mut self) -> Result<(), StorageError> {
        let bytes = self.config.to_bytes();
        let marker = Field::Marker.offset();
        self.storage.write(marker + 1, &bytes[marker + 1..])?;
        self.storage.write(marker, &bytes[..marker + 1])?;
        self.storage.commit()
    }

    // Full slot width, so a shorter value never inherits trailing bytes.
    fn write_slot(&mut self, field: Field, value: &str) -> Result<(), StorageError> {
        self.storage
            .write(field.offset(), &encode_slot(value, field.width()))
    }
}
