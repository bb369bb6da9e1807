use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::Result;
use crate::types::*;

/// Device attribute holding the temperature offset.
pub const TEMP_OFFSET_ATTR: &str = "temperatureOffset";

/// Remote heating API. Every call may fail; the quota reported by the most
/// recent response is available from `quota()`.
#[async_trait]
pub trait TadoApi: Send + Sync {
    async fn get_zones(&self) -> Result<Vec<Zone>>;
    async fn get_devices(&self) -> Result<Vec<Device>>;
    async fn get_capabilities(&self, zone: ZoneId) -> Result<Capabilities>;
    async fn get_home_state(&self) -> Result<HomeState>;
    async fn get_zone_states(&self) -> Result<BTreeMap<ZoneId, ZoneState>>;
    async fn get_device_info(&self, serial: &str, attr: &str) -> Result<Value>;
    /// Minimum away temperature, if one is configured.
    async fn get_away_configuration(&self, zone: ZoneId) -> Result<Option<f64>>;

    async fn set_presence(&self, presence: Presence) -> Result<()>;
    async fn set_child_lock(&self, serial: &str, enabled: bool) -> Result<()>;
    async fn set_temperature_offset(&self, serial: &str, offset: f64) -> Result<()>;
    async fn set_away_configuration(&self, zone: ZoneId, temperature: f64) -> Result<()>;
    async fn set_dazzle_mode(&self, zone: ZoneId, enabled: bool) -> Result<()>;
    async fn set_early_start(&self, zone: ZoneId, enabled: bool) -> Result<()>;
    async fn set_open_window_detection(&self, zone: ZoneId, enabled: bool) -> Result<()>;
    async fn identify_device(&self, serial: &str) -> Result<()>;
    async fn reset_all_zones_overlay(&self, zones: &[ZoneId]) -> Result<()>;
    async fn set_all_zones_overlay(&self, overlays: &[(ZoneId, ZoneOverlay)]) -> Result<()>;
    async fn add_meter_reading(&self, reading: u32, date: Option<NaiveDate>) -> Result<()>;

    /// Quota from the last response that carried quota headers.
    fn quota(&self) -> Option<RateLimit>;
}
