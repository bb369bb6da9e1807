use std::collections::BTreeMap;

use serde::Serialize;

use crate::overlay::{OptimisticOverlay, OptimisticValue};
use crate::types::*;

const TEMPERATURE_EPSILON: f64 = 0.05;

/// Per-zone boolean settings stored on zone metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneFlag {
    Dazzle,
    EarlyStart,
    OpenWindow,
}

impl ZoneFlag {
    pub fn key(&self, zone: ZoneId) -> ResourceKey {
        match self {
            ZoneFlag::Dazzle => ResourceKey::Dazzle(zone),
            ZoneFlag::EarlyStart => ResourceKey::EarlyStart(zone),
            ZoneFlag::OpenWindow => ResourceKey::OpenWindow(zone),
        }
    }

    fn get(&self, zone: &Zone) -> Option<bool> {
        match self {
            ZoneFlag::Dazzle => zone.dazzle_enabled,
            ZoneFlag::EarlyStart => zone.early_start_enabled,
            ZoneFlag::OpenWindow => zone.open_window_detection,
        }
    }
}

/// Previous cached value captured when a write patched the read state.
#[derive(Debug, Clone, PartialEq)]
pub enum Rollback {
    ZoneState { zone: ZoneId, prior: Option<ZoneState> },
    Home(Option<HomeState>),
    Device { serial: String, prior: Option<Device> },
    Offset { serial: String, prior: Option<f64> },
    AwayTemp { zone: ZoneId, prior: Option<f64> },
    ZoneMeta { zone: ZoneId, prior: Option<Zone> },
}

/// Last confirmed state from the remote API, patched in place by writes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadState {
    pub home: Option<HomeState>,
    pub zone_states: BTreeMap<ZoneId, ZoneState>,
    pub zones: BTreeMap<ZoneId, Zone>,
    /// Keyed by full serial number.
    pub devices: BTreeMap<String, Device>,
    pub capabilities: BTreeMap<ZoneId, Capabilities>,
    pub offsets: BTreeMap<String, f64>,
    pub away_temps: BTreeMap<ZoneId, f64>,
    pub rate_limit: RateLimit,
}

pub fn zone_with_overlay(
    state: &ZoneState,
    overlay: Option<ZoneOverlay>,
) -> (ZoneState, ZoneState) {
    let mut next = state.clone();
    if let Some(o) = overlay {
        next.setting = o.setting;
    }
    next.overlay = overlay;
    (next, state.clone())
}

pub fn device_with_child_lock(device: &Device, enabled: bool) -> (Device, Device) {
    let mut next = device.clone();
    next.child_lock_enabled = Some(enabled);
    (next, device.clone())
}

pub fn zone_with_flag(zone: &Zone, flag: ZoneFlag, enabled: bool) -> (Zone, Zone) {
    let mut next = zone.clone();
    match flag {
        ZoneFlag::Dazzle => next.dazzle_enabled = Some(enabled),
        ZoneFlag::EarlyStart => next.early_start_enabled = Some(enabled),
        ZoneFlag::OpenWindow => next.open_window_detection = Some(enabled),
    }
    (next, zone.clone())
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < TEMPERATURE_EPSILON
}

impl ReadState {
    pub fn is_empty(&self) -> bool {
        self.home.is_none() && self.zone_states.is_empty() && self.zones.is_empty()
    }

    pub fn zone_type(&self, zone: ZoneId) -> Option<ZoneType> {
        self.zones
            .get(&zone)
            .map(|z| z.zone_type)
            .or_else(|| self.zone_states.get(&zone).map(|s| s.setting.zone_type))
    }

    pub fn device_by_short_serial(&self, short: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.short_serial_no == short)
    }

    pub fn patch_zone_overlay(&mut self, zone: ZoneId, overlay: Option<ZoneOverlay>) -> Rollback {
        let prior = match self.zone_states.get(&zone) {
            Some(state) => {
                let (next, old) = zone_with_overlay(state, overlay);
                self.zone_states.insert(zone, next);
                Some(old)
            }
            None => None,
        };
        Rollback::ZoneState { zone, prior }
    }

    pub fn patch_presence(&mut self, presence: Presence) -> Rollback {
        let prior = self.home;
        self.home = Some(HomeState {
            presence,
            presence_locked: presence != Presence::Auto,
        });
        Rollback::Home(prior)
    }

    pub fn patch_child_lock(&mut self, serial: &str, enabled: bool) -> Rollback {
        let prior = match self.devices.get(serial) {
            Some(device) => {
                let (next, old) = device_with_child_lock(device, enabled);
                self.devices.insert(serial.to_string(), next);
                Some(old)
            }
            None => None,
        };
        Rollback::Device {
            serial: serial.to_string(),
            prior,
        }
    }

    pub fn patch_offset(&mut self, serial: &str, offset: f64) -> Rollback {
        let prior = self.offsets.insert(serial.to_string(), offset);
        Rollback::Offset {
            serial: serial.to_string(),
            prior,
        }
    }

    pub fn patch_away_temp(&mut self, zone: ZoneId, temperature: f64) -> Rollback {
        let prior = self.away_temps.insert(zone, temperature);
        Rollback::AwayTemp { zone, prior }
    }

    pub fn patch_zone_flag(&mut self, zone: ZoneId, flag: ZoneFlag, enabled: bool) -> Rollback {
        let prior = match self.zones.get(&zone) {
            Some(z) => {
                let (next, old) = zone_with_flag(z, flag, enabled);
                self.zones.insert(zone, next);
                Some(old)
            }
            None => None,
        };
        Rollback::ZoneMeta { zone, prior }
    }

    pub fn restore(&mut self, rollback: Rollback) {
        match rollback {
            Rollback::ZoneState { zone, prior } => {
                if let Some(s) = prior {
                    self.zone_states.insert(zone, s);
                }
            }
            Rollback::Home(prior) => self.home = prior,
            Rollback::Device { serial, prior } => {
                if let Some(d) = prior {
                    self.devices.insert(serial, d);
                }
            }
            Rollback::Offset { serial, prior } => match prior {
                Some(v) => {
                    self.offsets.insert(serial, v);
                }
                None => {
                    self.offsets.remove(&serial);
                }
            },
            Rollback::AwayTemp { zone, prior } => match prior {
                Some(v) => {
                    self.away_temps.insert(zone, v);
                }
                None => {
                    self.away_temps.remove(&zone);
                }
            },
            Rollback::ZoneMeta { zone, prior } => {
                if let Some(z) = prior {
                    self.zones.insert(zone, z);
                }
            }
        }
    }

    /// True when confirmed state already reflects an optimistic value.
    pub fn confirms(&self, key: &ResourceKey, value: &OptimisticValue) -> bool {
        match (key, value) {
            (
                ResourceKey::Zone(id),
                OptimisticValue::Zone {
                    overlay_active,
                    power,
                    temperature,
                },
            ) => self.zone_states.get(id).is_some_and(|s| {
                s.overlay_active() == *overlay_active
                    && power.is_none_or(|p| s.setting.power == p)
                    && temperature.is_none_or(|t| {
                        s.setting.temperature.is_some_and(|c| close(c, t))
                    })
            }),
            (ResourceKey::Presence, OptimisticValue::Presence(p)) => {
                self.home.is_some_and(|h| match p {
                    Presence::Auto => !h.presence_locked,
                    _ => h.presence_locked && h.presence == *p,
                })
            }
            (ResourceKey::ChildLock(serial), OptimisticValue::Flag(b)) => self
                .devices
                .get(serial)
                .is_some_and(|d| d.child_lock_enabled == Some(*b)),
            (ResourceKey::Offset(serial), OptimisticValue::Temperature(t)) => {
                self.offsets.get(serial).is_some_and(|v| close(*v, *t))
            }
            (ResourceKey::AwayTemp(zone), OptimisticValue::Temperature(t)) => {
                self.away_temps.get(zone).is_some_and(|v| close(*v, *t))
            }
            (ResourceKey::Dazzle(zone), OptimisticValue::Flag(b)) => {
                self.zone_flag_is(*zone, ZoneFlag::Dazzle, *b)
            }
            (ResourceKey::EarlyStart(zone), OptimisticValue::Flag(b)) => {
                self.zone_flag_is(*zone, ZoneFlag::EarlyStart, *b)
            }
            (ResourceKey::OpenWindow(zone), OptimisticValue::Flag(b)) => {
                self.zone_flag_is(*zone, ZoneFlag::OpenWindow, *b)
            }
            _ => false,
        }
    }

    fn zone_flag_is(&self, zone: ZoneId, flag: ZoneFlag, expected: bool) -> bool {
        self.zones
            .get(&zone)
            .is_some_and(|z| flag.get(z) == Some(expected))
    }

    /// Zone state with any pending optimistic write layered on top.
    pub fn merged_zone_state(
        &self,
        overlay: &OptimisticOverlay,
        zone: ZoneId,
    ) -> Option<ZoneState> {
        let confirmed = self.zone_states.get(&zone)?;
        let Some(OptimisticValue::Zone {
            overlay_active,
            power,
            temperature,
        }) = overlay.get(&ResourceKey::Zone(zone)).copied()
        else {
            return Some(confirmed.clone());
        };

        let mut merged = confirmed.clone();
        if overlay_active {
            let setting = OverlaySetting {
                zone_type: confirmed.setting.zone_type,
                power: power.unwrap_or(confirmed.setting.power),
                temperature: temperature.or(confirmed.setting.temperature),
            };
            let termination = confirmed
                .overlay
                .map(|o| o.termination)
                .unwrap_or(Termination::Manual);
            merged.setting = setting;
            merged.overlay = Some(ZoneOverlay {
                setting,
                termination,
            });
        } else {
            merged.overlay = None;
        }
        Some(merged)
    }

    pub fn merged_presence(&self, overlay: &OptimisticOverlay) -> Option<Presence> {
        match overlay.get(&ResourceKey::Presence) {
            Some(OptimisticValue::Presence(p)) => Some(*p),
            _ => self.home.map(|h| h.presence),
        }
    }

    pub fn merged_child_lock(&self, overlay: &OptimisticOverlay, serial: &str) -> Option<bool> {
        match overlay.get(&ResourceKey::ChildLock(serial.to_string())) {
            Some(OptimisticValue::Flag(b)) => Some(*b),
            _ => self.devices.get(serial).and_then(|d| d.child_lock_enabled),
        }
    }

    pub fn merged_offset(&self, overlay: &OptimisticOverlay, serial: &str) -> Option<f64> {
        match overlay.get(&ResourceKey::Offset(serial.to_string())) {
            Some(OptimisticValue::Temperature(t)) => Some(*t),
            _ => self.offsets.get(serial).copied(),
        }
    }

    pub fn merged_away_temp(&self, overlay: &OptimisticOverlay, zone: ZoneId) -> Option<f64> {
        match overlay.get(&ResourceKey::AwayTemp(zone)) {
            Some(OptimisticValue::Temperature(t)) => Some(*t),
            _ => self.away_temps.get(&zone).copied(),
        }
    }

    pub fn merged_zone_flag(
        &self,
        overlay: &OptimisticOverlay,
        zone: ZoneId,
        flag: ZoneFlag,
    ) -> Option<bool> {
        match overlay.get(&flag.key(zone)) {
            Some(OptimisticValue::Flag(b)) => Some(*b),
            _ => self.zones.get(&zone).and_then(|z| flag.get(z)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn heating_state(zone: ZoneId, power: Power, overlay: bool) -> ZoneState {
        let setting = OverlaySetting {
            zone_type: ZoneType::Heating,
            power,
            temperature: Some(19.0),
        };
        ZoneState {
            zone_id: zone,
            setting,
            overlay: overlay.then_some(ZoneOverlay {
                setting,
                termination: Termination::Manual,
            }),
            inside_temperature: Some(20.1),
            humidity: None,
            open_window_detected: false,
        }
    }

    #[test]
    fn patch_returns_previous_snapshot() {
        let mut state = ReadState::default();
        state.zone_states.insert(1, heating_state(1, Power::Off, false));

        let overlay = ZoneOverlay {
            setting: OverlaySetting {
                zone_type: ZoneType::Heating,
                power: Power::On,
                temperature: Some(22.0),
            },
            termination: Termination::NextTimeBlock,
        };
        let rollback = state.patch_zone_overlay(1, Some(overlay));
        assert_eq!(state.zone_states[&1].setting.power, Power::On);
        assert!(state.zone_states[&1].overlay_active());

        state.restore(rollback);
        assert_eq!(state.zone_states[&1], heating_state(1, Power::Off, false));
    }

    #[test]
    fn patch_unknown_zone_is_noop() {
        let mut state = ReadState::default();
        let rollback = state.patch_zone_overlay(9, None);
        assert_eq!(rollback, Rollback::ZoneState { zone: 9, prior: None });
        assert!(state.zone_states.is_empty());
    }

    #[test]
    fn optimistic_zone_wins_over_confirmed() {
        let mut state = ReadState::default();
        state.zone_states.insert(5, heating_state(5, Power::Off, false));

        let mut overlay = OptimisticOverlay::new();
        let value = OptimisticValue::Zone {
            overlay_active: true,
            power: Some(Power::On),
            temperature: None,
        };
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        overlay.set(ResourceKey::Zone(5), value, now);

        let merged = state.merged_zone_state(&overlay, 5).unwrap();
        assert_eq!(merged.setting.power, Power::On);
        assert!(merged.overlay_active());
        assert!(!state.confirms(&ResourceKey::Zone(5), &value));

        state.zone_states.insert(5, heating_state(5, Power::On, true));
        assert!(state.confirms(&ResourceKey::Zone(5), &value));
    }

    #[test]
    fn zone_confirmation_requires_target_temperature() {
        let mut state = ReadState::default();
        state.zone_states.insert(5, heating_state(5, Power::On, true));

        let raise = OptimisticValue::Zone {
            overlay_active: true,
            power: Some(Power::On),
            temperature: Some(23.0),
        };
        assert!(!state.confirms(&ResourceKey::Zone(5), &raise));

        let same = OptimisticValue::Zone {
            overlay_active: true,
            power: Some(Power::On),
            temperature: Some(19.02),
        };
        assert!(state.confirms(&ResourceKey::Zone(5), &same));
    }

    #[test]
    fn presence_confirmation_respects_lock() {
        let mut state = ReadState::default();
        state.home = Some(HomeState {
            presence: Presence::Home,
            presence_locked: false,
        });
        let auto = OptimisticValue::Presence(Presence::Auto);
        let home = OptimisticValue::Presence(Presence::Home);
        assert!(state.confirms(&ResourceKey::Presence, &auto));
        assert!(!state.confirms(&ResourceKey::Presence, &home));

        state.patch_presence(Presence::Away);
        assert_eq!(
            state.home,
            Some(HomeState {
                presence: Presence::Away,
                presence_locked: true
            })
        );
    }

    #[test]
    fn offset_restore_removes_new_entry() {
        let mut state = ReadState::default();
        let rollback = state.patch_offset("VA1", 0.5);
        assert_eq!(state.offsets.get("VA1"), Some(&0.5));
        state.restore(rollback);
        assert!(state.offsets.is_empty());
    }

    #[test]
    fn zone_flag_patch_and_merge() {
        let mut state = ReadState::default();
        state.zones.insert(
            2,
            Zone {
                id: 2,
                name: "Bath".into(),
                dazzle_enabled: Some(false),
                ..Zone::default()
            },
        );
        state.patch_zone_flag(2, ZoneFlag::Dazzle, true);
        assert!(state.confirms(&ResourceKey::Dazzle(2), &OptimisticValue::Flag(true)));
        let overlay = OptimisticOverlay::new();
        assert_eq!(state.merged_zone_flag(&overlay, 2, ZoneFlag::Dazzle), Some(true));
        assert_eq!(state.merged_zone_flag(&overlay, 2, ZoneFlag::EarlyStart), None);
    }
}
