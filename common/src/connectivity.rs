//! WiFi mode reconciliation.
//!
//! The manager owns the decision of which radio sides are up. The station
//! link is tracked from driver polls; the access point follows the boot
//! outcome, the recovery timer and the free-heap guard.

use log::{debug, info, warn};

use crate::{
    config::SwitchConfig,
    hal::{AccessPointSettings, Platform, StationCredentials, WifiRadio},
    record::DeviceConfig,
    types::{ConnectivityState, ScanEntry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StationLink {
    Idle,
    Associating { since_ms: u64 },
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApStatus {
    Off,
    Broadcasting,
    /// Shut down by the memory guard; comes back when the heap recovers.
    GuardDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    DisableAp,
    RestoreAp,
}

/// Free-heap hysteresis for the access point.
#[derive(Debug, Clone, Copy)]
pub struct ApGuard {
    low_bytes: u32,
    high_bytes: u32,
    tripped: bool,
}

impl ApGuard {
    pub fn new(low_bytes: u32, high_bytes: u32) -> Self {
        Self {
            low_bytes,
            high_bytes,
            tripped: false,
        }
    }

    /// Trips once when the heap falls below the low mark with the AP up, and
    /// releases once when it climbs above the high mark.
    pub fn evaluate(&mut self, free_heap: u32, ap_active: bool) -> Option<GuardAction> {
        if !self.tripped {
            if ap_active && free_heap < self.low_bytes {
                self.tripped = true;
                return Some(GuardAction::DisableAp);
            }
            return None;
        }

        if free_heap > self.high_bytes {
            self.tripped = false;
            return Some(GuardAction::RestoreAp);
        }
        None
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Re-arms the guard after its action could not be carried out.
    pub fn reset(&mut self) {
        self.tripped = false;
    }
}

#[derive(Debug, Default)]
struct ScanCache {
    pending: bool,
    results: Vec<ScanEntry>,
    updated_ms: Option<u64>,
}

pub struct ConnectivityManager {
    station: Option<StationCredentials>,
    access_point: AccessPointSettings,
    ap_fallback: bool,

    boot_timeout_ms: u64,
    poll_ms: u64,
    retry_ms: u64,
    attempt_timeout_ms: u64,
    ap_recovery_after_ms: u64,
    guard_high_bytes: u32,
    scan_cache_ms: u64,

    link: StationLink,
    ap: ApStatus,
    guard: ApGuard,
    last_attempt_ms: Option<u64>,
    lost_since_ms: Option<u64>,
    scan: ScanCache,
}

impl ConnectivityManager {
    pub fn new(
        config: &SwitchConfig,
        device: &DeviceConfig,
        access_point: AccessPointSettings,
    ) -> Self {
        let station = device.has_station_credentials().then(|| StationCredentials {
            ssid: device.ssid.clone(),
            passphrase: device.passphrase.clone(),
            hostname: device.hostname.clone(),
        });

        Self {
            station,
            access_point,
            ap_fallback: device.ap_fallback,
            boot_timeout_ms: config.station_boot_timeout_ms,
            poll_ms: config.station_poll_ms,
            retry_ms: config.station_retry_ms,
            attempt_timeout_ms: config.station_attempt_timeout_ms,
            ap_recovery_after_ms: config.ap_recovery_after_ms,
            guard_high_bytes: config.ap_guard_high_bytes,
            scan_cache_ms: config.scan_cache_ms,
            link: StationLink::Idle,
            ap: ApStatus::Off,
            guard: ApGuard::new(config.ap_guard_low_bytes, config.ap_guard_high_bytes),
            last_attempt_ms: None,
            lost_since_ms: None,
            scan: ScanCache::default(),
        }
    }

    /// Starts station association when credentials are stored. Returns
    /// whether the caller should wait for the link.
    pub fn begin<R: WifiRadio>(&mut self, radio: &mut R, now_ms: u64) -> bool {
        let Some(station) = self.station.as_ref() else {
            info!("No stored station credentials");
            return false;
        };

        info!("Connecting to {:?}", station.ssid);
        if let Err(err) = radio.configure(Some(station), None) {
            warn!("Station configuration failed: {err}");
            return false;
        }
        self.start_attempt(radio, now_ms)
    }

    /// Bounded boot wait. `service` runs between polls so the control surface
    /// stays reachable while the radio associates.
    pub fn wait_for_station<C, R, F>(&mut self, platform: &C, radio: &mut R, mut service: F) -> bool
    where
        C: Platform,
        R: WifiRadio,
        F: FnMut(&Self),
    {
        let deadline = platform.now_ms().saturating_add(self.boot_timeout_ms);
        loop {
            if radio.station_connected() {
                return true;
            }
            if platform.now_ms() >= deadline {
                return false;
            }
            service(self);
            platform.delay_ms(self.poll_ms);
        }
    }

    pub fn finish_boot<R: WifiRadio>(
        &mut self,
        radio: &mut R,
        connected: bool,
        free_heap: u32,
        now_ms: u64,
    ) {
        if connected {
            self.link = StationLink::Up;
            if self.dual_allowed(free_heap) {
                self.set_ap(radio, true);
            }
            info!("WiFi up: {}", self.state().as_str());
            return;
        }

        if self.station.is_some() {
            warn!("Station association timed out, starting access point");
            self.link = StationLink::Idle;
            self.last_attempt_ms = Some(now_ms);
            self.lost_since_ms = Some(now_ms);
        }
        self.set_ap(radio, true);
        info!("Access point {:?} up", self.access_point.ssid);
    }

    pub fn tick<R: WifiRadio>(&mut self, radio: &mut R, free_heap: u32, now_ms: u64) {
        self.track_station(radio, free_heap, now_ms);
        self.retry_station(radio, now_ms);
        self.recover_access_point(radio, now_ms);
        self.apply_guard(radio, free_heap);
        self.poll_scan(radio, now_ms);
    }

    /// Starts a background scan unless one is running or the cache is fresh.
    pub fn request_scan<R: WifiRadio>(&mut self, radio: &mut R, now_ms: u64) {
        if self.scan.pending {
            return;
        }
        if let Some(updated) = self.scan.updated_ms {
            if now_ms.saturating_sub(updated) < self.scan_cache_ms {
                return;
            }
        }

        match radio.start_scan() {
            Ok(()) => {
                debug!("WiFi scan started");
                self.scan.pending = true;
            }
            Err(err) => warn!("WiFi scan failed to start: {err}"),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        let ap_up = self.ap == ApStatus::Broadcasting;
        match (self.link, ap_up) {
            (StationLink::Up, true) => ConnectivityState::DualMode,
            (StationLink::Up, false) => ConnectivityState::StationConnected,
            (_, true) => ConnectivityState::AccessPointOnly,
            (StationLink::Associating { .. }, false) => ConnectivityState::ConnectingStation,
            (StationLink::Idle, false) => ConnectivityState::Disconnected,
        }
    }

    pub fn station_connected(&self) -> bool {
        self.link == StationLink::Up
    }

    pub fn ap_status(&self) -> ApStatus {
        self.ap
    }

    pub fn ap_guarded(&self) -> bool {
        self.guard.is_tripped()
    }

    pub fn access_point_ssid(&self) -> &str {
        &self.access_point.ssid
    }

    pub fn scan_results(&self) -> &[ScanEntry] {
        &self.scan.results
    }

    pub fn scan_pending(&self) -> bool {
        self.scan.pending
    }

    fn track_station<R: WifiRadio>(&mut self, radio: &mut R, free_heap: u32, now_ms: u64) {
        let connected = radio.station_connected();
        match self.link {
            StationLink::Up if !connected => {
                warn!("Station link lost");
                self.link = StationLink::Idle;
                self.lost_since_ms = Some(now_ms);
                // First retry goes out on the next tick.
                self.last_attempt_ms = None;
            }
            StationLink::Associating { .. } | StationLink::Idle if connected => {
                info!("Station link up");
                self.link = StationLink::Up;
                self.lost_since_ms = None;
                if self.ap == ApStatus::Broadcasting && !self.dual_allowed(free_heap) {
                    self.set_ap(radio, false);
                    info!("Access point dropped, station is back");
                }
            }
            StationLink::Associating { since_ms }
                if now_ms.saturating_sub(since_ms) >= self.attempt_timeout_ms =>
            {
                warn!("Station association attempt timed out");
                self.link = StationLink::Idle;
            }
            _ => {}
        }
    }

    fn retry_station<R: WifiRadio>(&mut self, radio: &mut R, now_ms: u64) {
        if self.station.is_none() || self.link != StationLink::Idle {
            return;
        }
        let due = self
            .last_attempt_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.retry_ms);
        if due {
            debug!("Retrying station association");
            self.start_attempt(radio, now_ms);
        }
    }

    fn recover_access_point<R: WifiRadio>(&mut self, radio: &mut R, now_ms: u64) {
        if !self.ap_fallback || self.ap != ApStatus::Off || self.link == StationLink::Up {
            return;
        }
        let Some(lost_since) = self.lost_since_ms else {
            return;
        };
        if now_ms.saturating_sub(lost_since) >= self.ap_recovery_after_ms {
            self.set_ap(radio, true);
            info!("Station down too long, access point {:?} up", self.access_point.ssid);
        }
    }

    fn apply_guard<R: WifiRadio>(&mut self, radio: &mut R, free_heap: u32) {
        match self.guard.evaluate(free_heap, self.ap == ApStatus::Broadcasting) {
            Some(GuardAction::DisableAp) => {
                warn!("Free heap {free_heap} below guard, disabling access point");
                if self.set_ap(radio, false) {
                    self.ap = ApStatus::GuardDisabled;
                } else {
                    self.guard.reset();
                }
            }
            Some(GuardAction::RestoreAp) => {
                if self.ap != ApStatus::GuardDisabled {
                    return;
                }
                if self.link != StationLink::Up || self.dual_allowed(free_heap) {
                    info!("Free heap {free_heap} recovered, restoring access point");
                    self.set_ap(radio, true);
                } else {
                    self.ap = ApStatus::Off;
                }
            }
            None => {}
        }
    }

    fn poll_scan<R: WifiRadio>(&mut self, radio: &mut R, now_ms: u64) {
        if !self.scan.pending {
            return;
        }
        if let Some(results) = radio.scan_results() {
            debug!("WiFi scan found {} networks", results.len());
            self.scan.results = results;
            self.scan.pending = false;
            self.scan.updated_ms = Some(now_ms);
        }
    }

    fn start_attempt<R: WifiRadio>(&mut self, radio: &mut R, now_ms: u64) -> bool {
        self.last_attempt_ms = Some(now_ms);
        match radio.connect_station() {
            Ok(()) => {
                self.link = StationLink::Associating { since_ms: now_ms };
                true
            }
            Err(err) => {
                warn!("Station connect failed: {err}");
                self.link = StationLink::Idle;
                false
            }
        }
    }

    fn dual_allowed(&self, free_heap: u32) -> bool {
        self.ap_fallback && free_heap > self.guard_high_bytes
    }

    fn set_ap<R: WifiRadio>(&mut self, radio: &mut R, up: bool) -> bool {
        let access_point = up.then_some(&self.access_point);
        match radio.configure(self.station.as_ref(), access_point) {
            Ok(()) => {
                self.ap = if up { ApStatus::Broadcasting } else { ApStatus::Off };
                true
            }
            Err(err) => {
                warn!("Radio reconfiguration failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        testing::{FakeRadio, ManualClock},
        types::DeviceIdentity,
    };

    const PLENTY: u32 = 64 * 1024;

    fn settings() -> AccessPointSettings {
        AccessPointSettings {
            ssid: "RelaySwitch-ABCDEF".to_string(),
            passphrase: "relaysetup".to_string(),
            gateway: [192, 168, 4, 1],
        }
    }

    fn device(ssid: &str, ap_fallback: bool) -> DeviceConfig {
        let mut device = DeviceConfig::defaults(&DeviceIdentity::from_mac([0, 0, 0, 0xab, 0xcd, 0xef]));
        device.ssid = ssid.to_string();
        device.passphrase = "secret123".to_string();
        device.ap_fallback = ap_fallback;
        device
    }

    fn manager(ssid: &str, ap_fallback: bool) -> ConnectivityManager {
        ConnectivityManager::new(&SwitchConfig::default(), &device(ssid, ap_fallback), settings())
    }

    /// Boots against a reachable network with the given heap.
    fn booted(ap_fallback: bool, heap: u32) -> (ConnectivityManager, FakeRadio) {
        let mut radio = FakeRadio::default();
        radio.set_available(true);
        let mut manager = manager("Home", ap_fallback);
        assert!(manager.begin(&mut radio, 0));
        manager.finish_boot(&mut radio, true, heap, 0);
        (manager, radio)
    }

    #[test]
    fn no_credentials_goes_straight_to_access_point() {
        let mut radio = FakeRadio::default();
        let mut manager = manager("", true);

        assert!(!manager.begin(&mut radio, 0));
        manager.finish_boot(&mut radio, false, PLENTY, 0);

        assert_eq!(manager.state(), ConnectivityState::AccessPointOnly);
        assert_eq!(radio.connect_calls(), 0);
        let (station, ap) = radio.last_configuration().unwrap();
        assert_eq!(station, None);
        assert_eq!(ap, Some(settings()));
    }

    #[test]
    fn single_character_ssid_is_ignored() {
        let mut radio = FakeRadio::default();
        let mut manager = manager("x", true);

        assert!(!manager.begin(&mut radio, 0));
    }

    #[test]
    fn boot_wait_services_surface_and_times_out() {
        let clock = ManualClock::new(0);
        let mut radio = FakeRadio::default();
        let mut manager = manager("Home", true);
        let serviced = Cell::new(0);

        assert!(manager.begin(&mut radio, clock.now_ms()));
        let connected = manager.wait_for_station(&clock, &mut radio, |m| {
            assert_eq!(m.state(), ConnectivityState::ConnectingStation);
            serviced.set(serviced.get() + 1);
        });

        assert!(!connected);
        assert_eq!(clock.now_ms(), 10_000);
        assert_eq!(serviced.get(), 40);

        manager.finish_boot(&mut radio, connected, PLENTY, clock.now_ms());
        assert_eq!(manager.state(), ConnectivityState::AccessPointOnly);
        // Mixed mode keeps the station side configured for retries.
        let (station, ap) = radio.last_configuration().unwrap();
        assert!(station.is_some());
        assert!(ap.is_some());
    }

    #[test]
    fn boot_wait_returns_once_station_associates() {
        let clock = ManualClock::new(0);
        let mut radio = FakeRadio::default();
        let handle = radio.clone();
        let mut manager = manager("Home", false);

        manager.begin(&mut radio, 0);
        let connected = manager.wait_for_station(&clock, &mut radio, |_| {
            if clock.now_ms() >= 1_000 {
                handle.set_available(true);
            }
        });

        assert!(connected);
        assert_eq!(clock.now_ms(), 1_250);
        manager.finish_boot(&mut radio, connected, PLENTY, clock.now_ms());
        assert_eq!(manager.state(), ConnectivityState::StationConnected);
    }

    #[test]
    fn dual_mode_needs_fallback_and_heap() {
        let (manager, _) = booted(true, PLENTY);
        assert_eq!(manager.state(), ConnectivityState::DualMode);

        let (manager, _) = booted(true, 16 * 1024);
        assert_eq!(manager.state(), ConnectivityState::StationConnected);

        let (manager, _) = booted(false, PLENTY);
        assert_eq!(manager.state(), ConnectivityState::StationConnected);
    }

    #[test]
    fn lost_station_retries_immediately_then_on_cooldown() {
        let (mut manager, mut radio) = booted(false, PLENTY);
        radio.set_available(false);
        radio.drop_link();

        manager.tick(&mut radio, PLENTY, 1_000);
        assert_eq!(radio.connect_calls(), 2);
        assert_eq!(manager.state(), ConnectivityState::ConnectingStation);

        // Attempt times out after 10 s, next retry waits for the 15 s cooldown.
        manager.tick(&mut radio, PLENTY, 11_000);
        assert_eq!(manager.state(), ConnectivityState::Disconnected);
        manager.tick(&mut radio, PLENTY, 15_999);
        assert_eq!(radio.connect_calls(), 2);
        manager.tick(&mut radio, PLENTY, 16_000);
        assert_eq!(radio.connect_calls(), 3);

        radio.set_available(true);
        manager.tick(&mut radio, PLENTY, 16_250);
        assert_eq!(manager.state(), ConnectivityState::StationConnected);
    }

    #[test]
    fn access_point_recovers_after_long_station_loss() {
        let (mut manager, mut radio) = booted(true, 16 * 1024);
        radio.set_available(false);
        radio.drop_link();

        manager.tick(&mut radio, 16 * 1024, 1_000);
        manager.tick(&mut radio, 16 * 1024, 120_999);
        assert_eq!(manager.ap_status(), ApStatus::Off);

        manager.tick(&mut radio, 16 * 1024, 121_000);
        assert_eq!(manager.ap_status(), ApStatus::Broadcasting);
        assert_eq!(manager.state(), ConnectivityState::AccessPointOnly);

        // Station returns: the AP goes away again since dual mode is not allowed.
        radio.set_available(true);
        manager.tick(&mut radio, 16 * 1024, 135_000);
        manager.tick(&mut radio, 16 * 1024, 135_250);
        assert_eq!(manager.state(), ConnectivityState::StationConnected);
    }

    #[test]
    fn no_recovery_access_point_without_fallback() {
        let (mut manager, mut radio) = booted(false, PLENTY);
        radio.set_available(false);
        radio.drop_link();

        manager.tick(&mut radio, PLENTY, 1_000);
        manager.tick(&mut radio, PLENTY, 300_000);

        assert_eq!(manager.ap_status(), ApStatus::Off);
    }

    #[test]
    fn access_point_only_keeps_retrying_station() {
        let mut radio = FakeRadio::default();
        let mut manager = manager("Home", true);
        manager.begin(&mut radio, 0);
        manager.finish_boot(&mut radio, false, PLENTY, 10_000);
        assert_eq!(radio.connect_calls(), 1);

        manager.tick(&mut radio, PLENTY, 24_999);
        assert_eq!(radio.connect_calls(), 1);
        manager.tick(&mut radio, PLENTY, 25_000);
        assert_eq!(radio.connect_calls(), 2);
        assert_eq!(manager.state(), ConnectivityState::AccessPointOnly);

        radio.set_available(true);
        manager.tick(&mut radio, PLENTY, 25_250);
        assert_eq!(manager.state(), ConnectivityState::DualMode);
    }

    #[test]
    fn guard_hysteresis_fires_once_each_way() {
        let mut guard = ApGuard::new(12 * 1024, 20 * 1024);
        let readings = [30_000, 11_000, 10_000, 9_000, 15_000, 19_000, 21_000, 22_000, 11_000];
        let actions: Vec<_> = readings
            .iter()
            .filter_map(|heap| guard.evaluate(*heap, true))
            .collect();

        assert_eq!(
            actions,
            vec![GuardAction::DisableAp, GuardAction::RestoreAp, GuardAction::DisableAp]
        );
    }

    #[test]
    fn failed_guard_reconfiguration_keeps_access_point_status() {
        let mut radio = FakeRadio::default();
        let mut manager = manager("", true);
        manager.begin(&mut radio, 0);
        manager.finish_boot(&mut radio, false, PLENTY, 0);

        radio.fail_configure(true);
        manager.tick(&mut radio, 9_000, 1);
        assert_eq!(manager.ap_status(), ApStatus::Broadcasting);
        assert!(!manager.ap_guarded());

        radio.fail_configure(false);
        manager.tick(&mut radio, 9_000, 2);
        assert_eq!(manager.ap_status(), ApStatus::GuardDisabled);
        assert!(manager.ap_guarded());
    }

    #[test]
    fn guard_ignores_low_heap_without_access_point() {
        let mut guard = ApGuard::new(12 * 1024, 20 * 1024);

        assert_eq!(guard.evaluate(1_000, false), None);
        assert!(!guard.is_tripped());
    }

    #[test]
    fn guard_disables_and_restores_access_point() {
        let mut radio = FakeRadio::default();
        let mut manager = manager("", true);
        manager.begin(&mut radio, 0);
        manager.finish_boot(&mut radio, false, PLENTY, 0);
        let configured = radio.configure_calls();

        for (at, heap) in [(1, 11_000), (2, 9_000), (3, 15_000)] {
            manager.tick(&mut radio, heap, at);
        }
        assert_eq!(manager.ap_status(), ApStatus::GuardDisabled);
        assert!(manager.ap_guarded());
        assert_eq!(radio.configure_calls(), configured + 1);

        for (at, heap) in [(4, 21_000), (5, 25_000)] {
            manager.tick(&mut radio, heap, at);
        }
        assert_eq!(manager.ap_status(), ApStatus::Broadcasting);
        assert!(!manager.ap_guarded());
        assert_eq!(radio.configure_calls(), configured + 2);
    }

    #[test]
    fn scan_results_are_cached() {
        let mut radio = FakeRadio::default();
        let mut manager = manager("", true);
        radio.set_scan_results(vec![ScanEntry {
            ssid: "Home".to_string(),
            rssi: -52,
            secured: true,
        }]);

        manager.request_scan(&mut radio, 0);
        manager.request_scan(&mut radio, 1);
        assert_eq!(radio.scan_calls(), 1);
        assert!(manager.scan_pending());

        manager.tick(&mut radio, PLENTY, 2);
        assert!(!manager.scan_pending());
        assert_eq!(manager.scan_results().len(), 1);
        assert_eq!(manager.scan_results()[0].ssid, "Home");

        manager.request_scan(&mut radio, 10_000);
        assert_eq!(radio.scan_calls(), 1);
        manager.request_scan(&mut radio, 30_002);
        assert_eq!(radio.scan_calls(), 2);
    }
}
