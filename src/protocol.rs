use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::types::*;

pub const DEFAULT_BASE_URL: &str = "https://my.tado.com/api/v2";

pub fn termination_json(termination: &Termination) -> Value {
    match termination {
        Termination::Manual => json!({ "typeSkillBasedApp": "MANUAL" }),
        Termination::Timer { duration_s } => json!({
            "typeSkillBasedApp": "TIMER",
            "durationInSeconds": duration_s,
        }),
        Termination::NextTimeBlock => json!({ "typeSkillBasedApp": "NEXT_TIME_BLOCK" }),
        Termination::TadoMode => json!({ "type": "TADO_MODE" }),
    }
}

/// Temperature is only sent for powered-on settings.
pub fn setting_json(setting: &OverlaySetting) -> Value {
    let mut v = json!({
        "type": setting.zone_type.as_tado_str(),
        "power": setting.power.as_tado_str(),
    });
    if let (Power::On, Some(t)) = (setting.power, setting.temperature) {
        v["temperature"] = json!({ "celsius": t });
    }
    v
}

pub fn overlay_json(overlay: &ZoneOverlay) -> Value {
    json!({
        "setting": setting_json(&overlay.setting),
        "termination": termination_json(&overlay.termination),
    })
}

pub fn bulk_overlay_body(overlays: &[(ZoneId, ZoneOverlay)]) -> Value {
    let entries: Vec<Value> = overlays
        .iter()
        .map(|(zone, o)| json!({ "room": zone, "overlay": overlay_json(o) }))
        .collect();
    json!({ "overlays": entries })
}

pub fn bulk_resume_query(zones: &[ZoneId]) -> String {
    zones
        .iter()
        .map(|z| z.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn presence_lock_body(presence: Presence) -> Value {
    json!({ "homePresence": presence.as_tado_str() })
}

pub fn child_lock_body(enabled: bool) -> Value {
    json!({ "childLockEnabled": enabled })
}

pub fn offset_body(offset: f64) -> Value {
    json!({ "celsius": offset })
}

pub fn away_configuration_body(temperature: f64) -> Value {
    json!({
        "type": "HEATING",
        "autoAdjust": false,
        "setting": {
            "type": "HEATING",
            "power": "ON",
            "temperature": { "celsius": temperature },
        },
    })
}

pub fn enabled_body(enabled: bool) -> Value {
    json!({ "enabled": enabled })
}

pub fn meter_reading_body(reading: u32, date: Option<NaiveDate>) -> Value {
    let date = date.unwrap_or_else(|| chrono::Utc::now().date_naive());
    json!({
        "date": date.format("%Y-%m-%d").to_string(),
        "reading": reading,
    })
}

// Wire types. Only the fields the crate consumes are modeled.

#[derive(Debug, Deserialize)]
struct Celsius {
    celsius: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireZoneDevice {
    serial_no: String,
}

#[derive(Debug, Deserialize)]
struct WireEnabled {
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireZone {
    id: ZoneId,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    zone_type: String,
    #[serde(default)]
    devices: Vec<WireZoneDevice>,
    dazzle_enabled: Option<bool>,
    early_start: Option<WireEnabled>,
    open_window_detection: Option<WireEnabled>,
}

impl From<WireZone> for Zone {
    fn from(w: WireZone) -> Self {
        Zone {
            id: w.id,
            name: w.name,
            zone_type: ZoneType::from_tado_str(&w.zone_type).unwrap_or_default(),
            device_serials: w.devices.into_iter().map(|d| d.serial_no).collect(),
            dazzle_enabled: w.dazzle_enabled,
            early_start_enabled: w.early_start.and_then(|e| e.enabled),
            open_window_detection: w.open_window_detection.and_then(|e| e.enabled),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireCharacteristics {
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireDevice {
    serial_no: String,
    #[serde(default)]
    short_serial_no: String,
    #[serde(default)]
    device_type: String,
    #[serde(default)]
    characteristics: WireCharacteristics,
    child_lock_enabled: Option<bool>,
    battery_state: Option<String>,
    current_fw_version: Option<String>,
}

impl From<WireDevice> for Device {
    fn from(w: WireDevice) -> Self {
        let short = if w.short_serial_no.is_empty() {
            w.serial_no.clone()
        } else {
            w.short_serial_no
        };
        Device {
            serial_no: w.serial_no,
            short_serial_no: short,
            device_type: w.device_type,
            capabilities: w.characteristics.capabilities,
            child_lock_enabled: w.child_lock_enabled,
            battery_state: w.battery_state,
            firmware_version: w.current_fw_version,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRange {
    min: f64,
    max: f64,
    step: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireTemperatures {
    celsius: Option<WireRange>,
}

/// Capabilities are flat for heating and hot water, and nested per mode
/// (`COOL`, `HEAT`, ...) for air conditioning.
pub(crate) fn parse_capabilities(v: &Value) -> Capabilities {
    let zone_type = v
        .get("type")
        .and_then(Value::as_str)
        .and_then(ZoneType::from_tado_str)
        .unwrap_or_default();

    let range_of = |node: &Value| -> Option<TemperatureRange> {
        let temps: WireTemperatures =
            serde_json::from_value(node.get("temperatures")?.clone()).ok()?;
        temps.celsius.map(|r| TemperatureRange {
            min: r.min,
            max: r.max,
            step: r.step,
        })
    };

    let temperatures = range_of(v).or_else(|| {
        v.as_object()?
            .values()
            .filter(|m| m.is_object())
            .find_map(range_of)
    });

    Capabilities {
        zone_type,
        temperatures,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireHomeState {
    presence: String,
    #[serde(default)]
    presence_locked: bool,
}

impl From<WireHomeState> for HomeState {
    fn from(w: WireHomeState) -> Self {
        HomeState {
            presence: Presence::from_tado_str(&w.presence).unwrap_or(Presence::Home),
            presence_locked: w.presence_locked,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireSetting {
    #[serde(rename = "type")]
    zone_type: String,
    power: Option<String>,
    temperature: Option<Celsius>,
}

impl WireSetting {
    fn into_setting(self) -> OverlaySetting {
        OverlaySetting {
            zone_type: ZoneType::from_tado_str(&self.zone_type).unwrap_or_default(),
            power: self
                .power
                .as_deref()
                .and_then(Power::from_tado_str)
                .unwrap_or(Power::Off),
            temperature: self.temperature.and_then(|t| t.celsius),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTermination {
    #[serde(rename = "type")]
    kind: Option<String>,
    type_skill_based_app: Option<String>,
    duration_in_seconds: Option<u32>,
}

impl WireTermination {
    fn into_termination(self) -> Termination {
        let kind = self.type_skill_based_app.or(self.kind).unwrap_or_default();
        match kind.as_str() {
            "TIMER" => Termination::Timer {
                duration_s: self.duration_in_seconds.unwrap_or(DEFAULT_TIMER_MINUTES * 60),
            },
            "NEXT_TIME_BLOCK" => Termination::NextTimeBlock,
            "TADO_MODE" => Termination::TadoMode,
            _ => Termination::Manual,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireOverlay {
    setting: WireSetting,
    termination: Option<WireTermination>,
}

#[derive(Debug, Deserialize)]
struct WireHumidity {
    percentage: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSensorData {
    inside_temperature: Option<Celsius>,
    humidity: Option<WireHumidity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireZoneState {
    setting: WireSetting,
    overlay: Option<WireOverlay>,
    open_window: Option<Value>,
    #[serde(default)]
    sensor_data_points: WireSensorData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireZoneStates {
    zone_states: BTreeMap<String, WireZoneState>,
}

impl WireZoneStates {
    /// Entries whose key is not a zone id are skipped.
    pub fn into_states(self) -> BTreeMap<ZoneId, ZoneState> {
        self.zone_states
            .into_iter()
            .filter_map(|(id, w)| {
                let zone_id: ZoneId = id.parse().ok()?;
                let overlay = w.overlay.map(|o| ZoneOverlay {
                    setting: o.setting.into_setting(),
                    termination: o
                        .termination
                        .map(WireTermination::into_termination)
                        .unwrap_or(Termination::Manual),
                });
                Some((
                    zone_id,
                    ZoneState {
                        zone_id,
                        setting: w.setting.into_setting(),
                        overlay,
                        inside_temperature: w
                            .sensor_data_points
                            .inside_temperature
                            .and_then(|t| t.celsius),
                        humidity: w.sensor_data_points.humidity.and_then(|h| h.percentage),
                        open_window_detected: w.open_window.is_some_and(|v| !v.is_null()),
                    },
                ))
            })
            .collect()
    }
}

/// Extracts `minimumAwayTemperature.celsius` from an away configuration.
pub(crate) fn parse_away_temperature(v: &Value) -> Option<f64> {
    v.pointer("/minimumAwayTemperature/celsius")
        .and_then(Value::as_f64)
}

/// Extracts the celsius value from a temperature offset response.
pub fn parse_offset(v: &Value) -> Option<f64> {
    v.get("celsius").and_then(Value::as_f64)
}
