#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{Value, json};
use tado_throttle::*;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    GetZones,
    GetDevices,
    GetCapabilities(ZoneId),
    GetHomeState,
    GetZoneStates,
    GetDeviceInfo(String, String),
    GetAwayConfiguration(ZoneId),
    SetPresence(Presence),
    SetChildLock(String, bool),
    SetOffset(String, f64),
    SetAwayConfiguration(ZoneId, f64),
    SetDazzle(ZoneId, bool),
    SetEarlyStart(ZoneId, bool),
    SetOpenWindow(ZoneId, bool),
    Identify(String),
    ResetOverlays(Vec<ZoneId>),
    SetOverlays(Vec<(ZoneId, ZoneOverlay)>),
    MeterReading(u32, Option<NaiveDate>),
}

impl Call {
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Call::GetZones
                | Call::GetDevices
                | Call::GetCapabilities(_)
                | Call::GetHomeState
                | Call::GetZoneStates
                | Call::GetDeviceInfo(..)
                | Call::GetAwayConfiguration(_)
        )
    }
}

#[derive(Default)]
struct FakeState {
    zones: Vec<Zone>,
    devices: Vec<Device>,
    capabilities: BTreeMap<ZoneId, Capabilities>,
    zone_states: BTreeMap<ZoneId, ZoneState>,
    home: Option<HomeState>,
    offsets: BTreeMap<String, f64>,
    away: BTreeMap<ZoneId, f64>,
    failing: HashSet<String>,
    quota: Option<RateLimit>,
    charge_calls: bool,
    zone_states_delay: Option<Duration>,
}

/// In-memory stand-in for the remote API. Records every call and fails
/// the ones named with `fail`.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
    calls: Mutex<Vec<Call>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Home with heating zones `ids`, one thermostat per zone and every zone
    /// following its schedule at 19 °C, power off.
    pub fn heating_home(ids: &[ZoneId]) -> Arc<Self> {
        let api = Self::new();
        for &id in ids {
            let state = zone_state(id, ZoneType::Heating, Power::Off, false);
            api.add_zone(heating_zone(id), Some(state));
            api.add_device(sensor_device(&format!("VA{id}")));
        }
        api.set_home(Presence::Home, false);
        api
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_zone(&self, zone: Zone, state: Option<ZoneState>) {
        let mut s = self.state();
        if let Some(st) = state {
            s.zone_states.insert(zone.id, st);
        }
        s.zones.push(zone);
    }

    pub fn add_device(&self, device: Device) {
        self.state().devices.push(device);
    }

    pub fn set_capabilities(&self, zone: ZoneId, caps: Capabilities) {
        self.state().capabilities.insert(zone, caps);
    }

    pub fn set_zone_state(&self, state: ZoneState) {
        self.state().zone_states.insert(state.zone_id, state);
    }

    pub fn set_home(&self, presence: Presence, locked: bool) {
        self.state().home = Some(HomeState {
            presence,
            presence_locked: locked,
        });
    }

    pub fn set_offset(&self, serial: &str, offset: f64) {
        self.state().offsets.insert(serial.to_string(), offset);
    }

    pub fn set_away(&self, zone: ZoneId, temperature: f64) {
        self.state().away.insert(zone, temperature);
    }

    pub fn set_quota(&self, limit: u32, remaining: u32) {
        self.state().quota = Some(RateLimit { limit, remaining });
    }

    /// Each call consumes one unit of the reported quota.
    pub fn charge_calls(&self) {
        self.state().charge_calls = true;
    }

    pub fn delay_zone_states(&self, by: Duration) {
        self.state().zone_states_delay = Some(by);
    }

    /// Fails calls named `name`, or only the one for `name:target`.
    pub fn fail(&self, name: &str) {
        self.state().failing.insert(name.to_string());
    }

    pub fn recover(&self, name: &str) {
        self.state().failing.remove(name);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_write).collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn zone_state_fetches(&self) -> usize {
        self.count(|c| *c == Call::GetZoneStates)
    }

    pub fn overlay_calls(&self) -> Vec<Vec<(ZoneId, ZoneOverlay)>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SetOverlays(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: Call, name: &str, target: Option<String>) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        let mut s = self.state();
        if s.charge_calls
            && let Some(q) = s.quota.as_mut()
        {
            q.remaining = q.remaining.saturating_sub(1);
        }
        let targeted = target.map(|t| format!("{name}:{t}"));
        if s.failing.contains(name) || targeted.is_some_and(|t| s.failing.contains(&t)) {
            return Err(Error::Api {
                status: 500,
                body: format!("{name} failed"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TadoApi for FakeApi {
    async fn get_zones(&self) -> Result<Vec<Zone>> {
        self.record(Call::GetZones, "get_zones", None)?;
        Ok(self.state().zones.clone())
    }

    async fn get_devices(&self) -> Result<Vec<Device>> {
        self.record(Call::GetDevices, "get_devices", None)?;
        Ok(self.state().devices.clone())
    }

    async fn get_capabilities(&self, zone: ZoneId) -> Result<Capabilities> {
        let target = Some(zone.to_string());
        self.record(Call::GetCapabilities(zone), "get_capabilities", target)?;
        let s = self.state();
        let zone_type = s
            .zones
            .iter()
            .find(|z| z.id == zone)
            .map(|z| z.zone_type)
            .unwrap_or_default();
        Ok(s.capabilities.get(&zone).copied().unwrap_or(Capabilities {
            zone_type,
            temperatures: None,
        }))
    }

    async fn get_home_state(&self) -> Result<HomeState> {
        self.record(Call::GetHomeState, "get_home_state", None)?;
        self.state().home.ok_or(Error::Api {
            status: 404,
            body: "no home".into(),
        })
    }

    async fn get_zone_states(&self) -> Result<BTreeMap<ZoneId, ZoneState>> {
        let delay = self.state().zone_states_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.record(Call::GetZoneStates, "get_zone_states", None)?;
        Ok(self.state().zone_states.clone())
    }

    async fn get_device_info(&self, serial: &str, attr: &str) -> Result<Value> {
        self.record(
            Call::GetDeviceInfo(serial.to_string(), attr.to_string()),
            "get_device_info",
            Some(serial.to_string()),
        )?;
        let offset = self.state().offsets.get(serial).copied().unwrap_or(0.0);
        Ok(json!({ "celsius": offset, "fahrenheit": offset * 1.8 }))
    }

    async fn get_away_configuration(&self, zone: ZoneId) -> Result<Option<f64>> {
        let target = Some(zone.to_string());
        self.record(Call::GetAwayConfiguration(zone), "get_away_configuration", target)?;
        Ok(self.state().away.get(&zone).copied())
    }

    async fn set_presence(&self, presence: Presence) -> Result<()> {
        self.record(Call::SetPresence(presence), "set_presence", None)
    }

    async fn set_child_lock(&self, serial: &str, enabled: bool) -> Result<()> {
        self.record(
            Call::SetChildLock(serial.to_string(), enabled),
            "set_child_lock",
            Some(serial.to_string()),
        )
    }

    async fn set_temperature_offset(&self, serial: &str, offset: f64) -> Result<()> {
        self.record(
            Call::SetOffset(serial.to_string(), offset),
            "set_temperature_offset",
            Some(serial.to_string()),
        )
    }

    async fn set_away_configuration(&self, zone: ZoneId, temperature: f64) -> Result<()> {
        self.record(
            Call::SetAwayConfiguration(zone, temperature),
            "set_away_configuration",
            Some(zone.to_string()),
        )
    }

    async fn set_dazzle_mode(&self, zone: ZoneId, enabled: bool) -> Result<()> {
        self.record(Call::SetDazzle(zone, enabled), "set_dazzle_mode", Some(zone.to_string()))
    }

    async fn set_early_start(&self, zone: ZoneId, enabled: bool) -> Result<()> {
        self.record(Call::SetEarlyStart(zone, enabled), "set_early_start", Some(zone.to_string()))
    }

    async fn set_open_window_detection(&self, zone: ZoneId, enabled: bool) -> Result<()> {
        self.record(
            Call::SetOpenWindow(zone, enabled),
            "set_open_window_detection",
            Some(zone.to_string()),
        )
    }

    async fn identify_device(&self, serial: &str) -> Result<()> {
        self.record(Call::Identify(serial.to_string()), "identify_device", Some(serial.to_string()))
    }

    async fn reset_all_zones_overlay(&self, zones: &[ZoneId]) -> Result<()> {
        self.record(Call::ResetOverlays(zones.to_vec()), "reset_all_zones_overlay", None)
    }

    async fn set_all_zones_overlay(&self, overlays: &[(ZoneId, ZoneOverlay)]) -> Result<()> {
        self.record(Call::SetOverlays(overlays.to_vec()), "set_all_zones_overlay", None)
    }

    async fn add_meter_reading(&self, reading: u32, date: Option<NaiveDate>) -> Result<()> {
        self.record(Call::MeterReading(reading, date), "add_meter_reading", None)
    }

    fn quota(&self) -> Option<RateLimit> {
        self.state().quota
    }
}

pub fn heating_zone(id: ZoneId) -> Zone {
    Zone {
        id,
        name: format!("Zone {id}"),
        zone_type: ZoneType::Heating,
        device_serials: vec![format!("VA{id}")],
        dazzle_enabled: Some(false),
        early_start_enabled: Some(true),
        open_window_detection: Some(false),
    }
}

pub fn typed_zone(id: ZoneId, zone_type: ZoneType) -> Zone {
    Zone {
        zone_type,
        ..heating_zone(id)
    }
}

pub fn zone_state(id: ZoneId, zone_type: ZoneType, power: Power, overlay: bool) -> ZoneState {
    let setting = OverlaySetting {
        zone_type,
        power,
        temperature: (power == Power::On).then_some(19.0),
    };
    ZoneState {
        zone_id: id,
        setting,
        overlay: overlay.then_some(ZoneOverlay {
            setting,
            termination: Termination::Manual,
        }),
        inside_temperature: Some(20.5),
        humidity: Some(45.0),
        open_window_detected: false,
    }
}

/// Heating zone held ON by a manual overlay at `temperature`.
pub fn heating_overlay(id: ZoneId, temperature: f64) -> ZoneState {
    let mut state = zone_state(id, ZoneType::Heating, Power::On, true);
    state.setting.temperature = Some(temperature);
    state.overlay = Some(ZoneOverlay {
        setting: state.setting,
        termination: Termination::Manual,
    });
    state
}

pub fn sensor_device(serial: &str) -> Device {
    Device {
        serial_no: serial.to_string(),
        short_serial_no: serial.to_string(),
        device_type: "VA02".into(),
        capabilities: vec![CAPABILITY_INSIDE_TEMP.to_string()],
        child_lock_enabled: Some(false),
        battery_state: Some("NORMAL".into()),
        firmware_version: Some("215.1".into()),
    }
}

pub fn plain_device(serial: &str) -> Device {
    Device {
        capabilities: Vec::new(),
        ..sensor_device(serial)
    }
}

/// Midday in Berlin, well away from the quota reset and the default
/// reduced window.
pub fn midday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 11, 0, 0).unwrap()
}

pub fn test_config() -> Config {
    Config {
        refresh_after_resume: false,
        ..Config::default()
    }
}
