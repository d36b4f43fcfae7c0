//! Persisted device record and its fixed byte layout.
//!
//! ```text
//! offset  width  field
//!      0      1  validity marker (RECORD_MARKER)
//!      1     32  hostname, NUL padded
//!     33     32  SSID, NUL padded
//!     65     64  passphrase, NUL padded
//!    129      1  AP fallback flag
//!    130      1  relay state
//! ```
//!
//! The layout is stable within a firmware version. Changing it requires a new
//! `RECORD_MARKER`, which makes every device reinitialize on first boot.

use crate::types::DeviceIdentity;

pub const RECORD_MARKER: u8 = 0xA7;

pub const HOSTNAME_SLOT: usize = 32;
pub const SSID_SLOT: usize = 32;
pub const PASSPHRASE_SLOT: usize = 64;

pub const MAX_HOSTNAME_LEN: usize = HOSTNAME_SLOT - 1;
pub const MAX_SSID_LEN: usize = SSID_SLOT - 1;
pub const MAX_PASSPHRASE_LEN: usize = PASSPHRASE_SLOT - 1;

const MARKER_OFFSET: usize = 0;
const HOSTNAME_OFFSET: usize = MARKER_OFFSET + 1;
const SSID_OFFSET: usize = HOSTNAME_OFFSET + HOSTNAME_SLOT;
const PASSPHRASE_OFFSET: usize = SSID_OFFSET + SSID_SLOT;
const AP_FALLBACK_OFFSET: usize = PASSPHRASE_OFFSET + PASSPHRASE_SLOT;
const RELAY_STATE_OFFSET: usize = AP_FALLBACK_OFFSET + 1;

pub const RECORD_LEN: usize = RELAY_STATE_OFFSET + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Marker,
    Hostname,
    Ssid,
    Passphrase,
    ApFallback,
    RelayState,
}

impl Field {
    pub fn offset(self) -> usize {
        match self {
            Self::Marker => MARKER_OFFSET,
            Self::Hostname => HOSTNAME_OFFSET,
            Self::Ssid => SSID_OFFSET,
            Self::Passphrase => PASSPHRASE_OFFSET,
            Self::ApFallback => AP_FALLBACK_OFFSET,
            Self::RelayState => RELAY_STATE_OFFSET,
        }
    }

    pub fn width(self) -> usize {
        match self {
            Self::Hostname => HOSTNAME_SLOT,
            Self::Ssid => SSID_SLOT,
            Self::Passphrase => PASSPHRASE_SLOT,
            Self::Marker | Self::ApFallback | Self::RelayState => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub hostname: String,
    pub ssid: String,
    pub passphrase: String,
    pub ap_fallback: bool,
    pub relay_on: bool,
}

impl DeviceConfig {
    pub fn defaults(identity: &DeviceIdentity) -> Self {
        Self {
            hostname: identity.default_hostname(),
            ssid: String::new(),
            passphrase: String::new(),
            ap_fallback: true,
            relay_on: false,
        }
    }

    /// A one-character SSID is treated as leftover garbage, not a network.
    pub fn has_station_credentials(&self) -> bool {
        self.ssid.trim().chars().count() >= 2
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut bytes = [0_u8; RECORD_LEN];
        bytes[MARKER_OFFSET] = RECORD_MARKER;
        put(&mut bytes, Field::Hostname, &encode_slot(&self.hostname, HOSTNAME_SLOT));
        put(&mut bytes, Field::Ssid, &encode_slot(&self.ssid, SSID_SLOT));
        put(
            &mut bytes,
            Field::Passphrase,
            &encode_slot(&self.passphrase, PASSPHRASE_SLOT),
        );
        bytes[AP_FALLBACK_OFFSET] = encode_flag(self.ap_fallback);
        bytes[RELAY_STATE_OFFSET] = encode_flag(self.relay_on);
        bytes
    }

    /// Decodes a record, or `None` when the marker does not match.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_LEN || bytes[MARKER_OFFSET] != RECORD_MARKER {
            return None;
        }

        Some(Self {
            hostname: decode_slot(slot(bytes, Field::Hostname)),
            ssid: decode_slot(slot(bytes, Field::Ssid)),
            passphrase: decode_slot(slot(bytes, Field::Passphrase)),
            ap_fallback: bytes[AP_FALLBACK_OFFSET] == 1,
            relay_on: bytes[RELAY_STATE_OFFSET] == 1,
        })
    }
}

/// Encodes `value` into a full-width slot: truncated on a char boundary to
/// leave room for the terminator, then NUL padded.
pub fn encode_slot(value: &str, width: usize) -> Vec<u8> {
    let max = width.saturating_sub(1);
    let mut end = value.len().min(max);
    while !value.is_char_boundary(end) {
        end -= 1;
    }

    let mut slot = vec![0_u8; width];
    slot[..end].copy_from_slice(&value.as_bytes()[..end]);
    slot
}

pub fn decode_slot(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn encode_flag(value: bool) -> u8 {
    u8::from(value)
}

fn slot(bytes: &[u8], field: Field) -> &[u8] {
    &bytes[field.offset()..field.offset() + field.width()]
}

fn put(bytes: &mut [u8], field: Field, value: &[u8]) {
    bytes[field.offset()..field.offset() + field.width()].copy_from_slice(value);
}
