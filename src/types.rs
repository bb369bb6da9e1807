use std::fmt;

use serde::Serialize;

pub type ZoneId = u32;

/// Temperature pushed by `boost_all_zones`.
pub const BOOST_TEMPERATURE_C: f64 = 25.0;

/// Timer length used when a timer overlay is requested without a duration.
pub const DEFAULT_TIMER_MINUTES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ZoneType {
    #[default]
    Heating,
    AirConditioning,
    HotWater,
}

impl ZoneType {
    pub fn as_tado_str(&self) -> &'static str {
        match self {
            ZoneType::Heating => "HEATING",
            ZoneType::AirConditioning => "AIR_CONDITIONING",
            ZoneType::HotWater => "HOT_WATER",
        }
    }

    pub fn from_tado_str(s: &str) -> Option<Self> {
        match s {
            "HEATING" => Some(ZoneType::Heating),
            "AIR_CONDITIONING" => Some(ZoneType::AirConditioning),
            "HOT_WATER" => Some(ZoneType::HotWater),
            _ => None,
        }
    }

    /// Safety ceiling applied to every requested target temperature.
    pub fn max_temperature(&self) -> f64 {
        match self {
            ZoneType::Heating => 25.0,
            ZoneType::AirConditioning => 30.0,
            ZoneType::HotWater => 65.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Power {
    On,
    Off,
}

impl Power {
    pub fn as_tado_str(&self) -> &'static str {
        match self {
            Power::On => "ON",
            Power::Off => "OFF",
        }
    }

    pub fn from_tado_str(s: &str) -> Option<Self> {
        match s {
            "ON" => Some(Power::On),
            "OFF" => Some(Power::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Presence {
    Home,
    Away,
    Auto,
}

impl Presence {
    pub fn as_tado_str(&self) -> &'static str {
        match self {
            Presence::Home => "HOME",
            Presence::Away => "AWAY",
            Presence::Auto => "AUTO",
        }
    }

    pub fn from_tado_str(s: &str) -> Option<Self> {
        match s {
            "HOME" => Some(Presence::Home),
            "AWAY" => Some(Presence::Away),
            "AUTO" => Some(Presence::Auto),
            _ => None,
        }
    }
}

/// How a caller wants an overlay to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayMode {
    Manual,
    Timer,
    NextBlock,
    Presence,
}

/// Overlay termination as understood by the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Termination {
    Manual,
    Timer { duration_s: u32 },
    NextTimeBlock,
    TadoMode,
}

impl Termination {
    /// Resolve the termination for an overlay request. A duration without an
    /// explicit mode implies a timer.
    pub fn resolve(mode: Option<OverlayMode>, duration_minutes: Option<u32>) -> Self {
        let minutes = duration_minutes.filter(|m| *m > 0);
        match mode {
            Some(OverlayMode::NextBlock) => Termination::NextTimeBlock,
            Some(OverlayMode::Presence) => Termination::TadoMode,
            Some(OverlayMode::Timer) => Termination::Timer {
                duration_s: minutes.unwrap_or(DEFAULT_TIMER_MINUTES) * 60,
            },
            _ => match minutes {
                Some(m) => Termination::Timer { duration_s: m * 60 },
                None => Termination::Manual,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlaySetting {
    pub zone_type: ZoneType,
    pub power: Power,
    pub temperature: Option<f64>,
}

/// A manual override of a zone's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneOverlay {
    pub setting: OverlaySetting,
    pub termination: Termination,
}

/// Last known live state of one zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneState {
    pub zone_id: ZoneId,
    pub setting: OverlaySetting,
    pub overlay: Option<ZoneOverlay>,
    pub inside_temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub open_window_detected: bool,
}

impl ZoneState {
    pub fn overlay_active(&self) -> bool {
        self.overlay.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HomeState {
    pub presence: Presence,
    pub presence_locked: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub zone_type: ZoneType,
    pub device_serials: Vec<String>,
    pub dazzle_enabled: Option<bool>,
    pub early_start_enabled: Option<bool>,
    pub open_window_detection: Option<bool>,
}

/// Device capability that marks a device as carrying a temperature sensor
/// (and therefore a configurable offset).
pub const CAPABILITY_INSIDE_TEMP: &str = "INSIDE_TEMPERATURE_MEASUREMENT";

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Device {
    pub serial_no: String,
    pub short_serial_no: String,
    pub device_type: String,
    pub capabilities: Vec<String>,
    pub child_lock_enabled: Option<bool>,
    pub battery_state: Option<String>,
    pub firmware_version: Option<String>,
}

impl Device {
    pub fn has_temperature_sensor(&self) -> bool {
        self.capabilities.iter().any(|c| c == CAPABILITY_INSIDE_TEMP)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureRange {
    pub min: f64,
    pub max: f64,
    pub step: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Capabilities {
    pub zone_type: ZoneType,
    pub temperatures: Option<TemperatureRange>,
}

impl Capabilities {
    pub fn supports_temperature(&self) -> bool {
        self.temperatures.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApiStatus {
    Connected,
    Throttled,
    RateLimited,
}

impl ApiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStatus::Connected => "connected",
            ApiStatus::Throttled => "throttled",
            ApiStatus::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which cached tracks a manual poll should refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RefreshScope {
    All,
    Metadata,
    Offsets,
    Away,
    Zone,
}

impl RefreshScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshScope::All => "all",
            RefreshScope::Metadata => "metadata",
            RefreshScope::Offsets => "offsets",
            RefreshScope::Away => "away",
            RefreshScope::Zone => "zone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(RefreshScope::All),
            "metadata" => Some(RefreshScope::Metadata),
            "offsets" => Some(RefreshScope::Offsets),
            "away" => Some(RefreshScope::Away),
            "zone" => Some(RefreshScope::Zone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacMode {
    Auto,
    Heat,
    Off,
}

/// Merge identity of a write. Rapid writes under the same key collapse into
/// one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ResourceKey {
    Zone(ZoneId),
    Presence,
    ChildLock(String),
    Offset(String),
    AwayTemp(ZoneId),
    Dazzle(ZoneId),
    EarlyStart(ZoneId),
    OpenWindow(ZoneId),
    Identify(String),
    ManualPoll(RefreshScope),
    ResumeRefresh,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Zone(id) => write!(f, "zone_{id}"),
            ResourceKey::Presence => f.write_str("presence"),
            ResourceKey::ChildLock(serial) => write!(f, "child_lock_{serial}"),
            ResourceKey::Offset(serial) => write!(f, "offset_{serial}"),
            ResourceKey::AwayTemp(id) => write!(f, "away_temp_{id}"),
            ResourceKey::Dazzle(id) => write!(f, "dazzle_{id}"),
            ResourceKey::EarlyStart(id) => write!(f, "early_start_{id}"),
            ResourceKey::OpenWindow(id) => write!(f, "open_window_{id}"),
            ResourceKey::Identify(serial) => write!(f, "identify_{serial}"),
            ResourceKey::ManualPoll(scope) => write!(f, "manual_poll_{}", scope.as_str()),
            ResourceKey::ResumeRefresh => f.write_str("refresh_after_resume"),
        }
    }
}

/// Events delivered to registered listeners.
#[derive(Debug, Clone)]
pub enum Update {
    Optimistic { keys: Vec<ResourceKey> },
    Refreshed,
    RefreshFailed { reason: String },
    RateLimit { rate_limit: RateLimit, status: ApiStatus },
    PollingChanged { enabled: bool },
}

/// Inbound notification of a write made outside this crate (e.g. a
/// platform-native thermostat entity) that should be reflected locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalChange {
    ResumeRequested(ZoneId),
    ManualOverride(ZoneId),
}
