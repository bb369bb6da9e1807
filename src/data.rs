use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::Config;
use crate::protocol::parse_offset;
use crate::remote::{TEMP_OFFSET_ATTR, TadoApi};
use crate::types::*;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Refresh cadences of the non-fast tracks. A zero offset interval means
/// offsets are fetched only after invalidation; a zero presence interval
/// means home state is fetched every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackIntervals {
    pub slow: Duration,
    pub offset: Duration,
    pub presence: Duration,
}

impl From<&Config> for TrackIntervals {
    fn from(config: &Config) -> Self {
        Self {
            slow: Duration::from_secs(config.slow_poll_interval_s),
            offset: Duration::from_secs(config.offset_poll_interval_s),
            presence: Duration::from_secs(config.presence_poll_interval_s),
        }
    }
}

/// Everything known after one fetch cycle. `home` is `None` when the
/// presence track was not due and nothing was cached yet.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub home: Option<HomeState>,
    pub zone_states: BTreeMap<ZoneId, ZoneState>,
    pub zones: BTreeMap<ZoneId, Zone>,
    pub devices: BTreeMap<String, Device>,
    pub capabilities: BTreeMap<ZoneId, Capabilities>,
    pub offsets: BTreeMap<String, f64>,
    pub away_temps: BTreeMap<ZoneId, f64>,
}

pub struct DataManager {
    api: Arc<dyn TadoApi>,
    intervals: TrackIntervals,
    zones: BTreeMap<ZoneId, Zone>,
    devices: BTreeMap<String, Device>,
    capabilities: BTreeMap<ZoneId, Capabilities>,
    offsets: BTreeMap<String, f64>,
    away_temps: BTreeMap<ZoneId, f64>,
    home: Option<HomeState>,
    last_slow: Option<Instant>,
    last_offset: Instant,
    last_presence: Option<Instant>,
    offset_invalidated: bool,
    away_invalidated: bool,
}

impl DataManager {
    pub fn new(api: Arc<dyn TadoApi>, intervals: TrackIntervals) -> Self {
        Self {
            api,
            intervals,
            zones: BTreeMap::new(),
            devices: BTreeMap::new(),
            capabilities: BTreeMap::new(),
            offsets: BTreeMap::new(),
            away_temps: BTreeMap::new(),
            home: None,
            last_slow: None,
            // The offset timer starts now so boot does not fetch offsets.
            last_offset: Instant::now(),
            last_presence: None,
            offset_invalidated: false,
            away_invalidated: false,
        }
    }

    pub fn zones(&self) -> &BTreeMap<ZoneId, Zone> {
        &self.zones
    }

    pub fn devices(&self) -> &BTreeMap<String, Device> {
        &self.devices
    }

    /// Runs every track that is due. Failures of the slow or fast track fail
    /// the cycle; per-zone and per-device sub-fetches are isolated.
    pub async fn fetch_full_update(&mut self) -> Result<FetchResult> {
        let now = Instant::now();

        let slow_due = self.zones.is_empty()
            || self
                .last_slow
                .is_none_or(|t| now.duration_since(t) > self.intervals.slow);
        if slow_due {
            info!("fetching slow-track metadata");
            let zones = self.api.get_zones().await?;
            let devices = self.api.get_devices().await?;
            self.zones = zones.into_iter().map(|z| (z.id, z)).collect();
            self.devices = devices.into_iter().map(|d| (d.serial_no.clone(), d)).collect();
            self.fetch_capabilities().await;
            self.last_slow = Some(now);
        }

        let offset_due = self.offset_invalidated
            || (!self.intervals.offset.is_zero()
                && now.duration_since(self.last_offset) > self.intervals.offset);
        if offset_due {
            self.fetch_offsets().await;
            self.last_offset = now;
            self.offset_invalidated = false;
        }

        if self.away_invalidated {
            self.fetch_away_temperatures().await;
            self.away_invalidated = false;
        }

        let presence_due = self.intervals.presence.is_zero()
            || self
                .last_presence
                .is_none_or(|t| now.duration_since(t) >= self.intervals.presence);
        if presence_due {
            self.home = Some(self.api.get_home_state().await?);
            self.last_presence = Some(now);
        }

        debug!("fetching fast-track states");
        let zone_states = self.api.get_zone_states().await?;

        Ok(FetchResult {
            home: self.home,
            zone_states,
            zones: self.zones.clone(),
            devices: self.devices.clone(),
            capabilities: self.capabilities.clone(),
            offsets: self.offsets.clone(),
            away_temps: self.away_temps.clone(),
        })
    }

    /// Heating zones always accept a temperature; only hot water and air
    /// conditioning zones are probed.
    async fn fetch_capabilities(&mut self) {
        let probed: Vec<ZoneId> = self
            .zones
            .values()
            .filter(|z| z.zone_type != ZoneType::Heating)
            .map(|z| z.id)
            .collect();
        for zone in probed {
            match self.api.get_capabilities(zone).await {
                Ok(caps) => {
                    self.capabilities.insert(zone, caps);
                }
                Err(e) => warn!(zone, error = %e, "failed to fetch capabilities"),
            }
        }
    }

    async fn fetch_offsets(&mut self) {
        let serials: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.has_temperature_sensor())
            .map(|d| d.serial_no.clone())
            .collect();
        if serials.is_empty() {
            debug!("no devices with temperature sensor, skipping offsets");
            return;
        }
        info!(count = serials.len(), "fetching temperature offsets");
        for serial in serials {
            match self.api.get_device_info(&serial, TEMP_OFFSET_ATTR).await {
                Ok(v) => match parse_offset(&v) {
                    Some(offset) => {
                        self.offsets.insert(serial, offset);
                    }
                    None => warn!(serial = %serial, "offset response without celsius value"),
                },
                Err(e) => warn!(serial = %serial, error = %e, "failed to fetch offset"),
            }
        }
    }

    async fn fetch_away_temperatures(&mut self) {
        let zones: Vec<ZoneId> = self
            .zones
            .values()
            .filter(|z| z.zone_type == ZoneType::Heating)
            .map(|z| z.id)
            .collect();
        if zones.is_empty() {
            debug!("no heating zones cached, skipping away configuration");
            return;
        }
        info!(count = zones.len(), "fetching away configuration");
        for zone in zones {
            match self.api.get_away_configuration(zone).await {
                Ok(Some(t)) => {
                    self.away_temps.insert(zone, t);
                }
                Ok(None) => {}
                Err(e) => warn!(zone, error = %e, "failed to fetch away configuration"),
            }
        }
    }

    /// Forces the targeted track on the next fetch regardless of its timer.
    pub fn invalidate_cache(&mut self, scope: RefreshScope) {
        debug!(scope = scope.as_str(), "invalidating cache");
        if matches!(scope, RefreshScope::All | RefreshScope::Metadata) {
            self.zones.clear();
        }
        if matches!(scope, RefreshScope::All | RefreshScope::Offsets) {
            self.offset_invalidated = true;
        }
        if matches!(scope, RefreshScope::All | RefreshScope::Away) {
            self.away_invalidated = true;
        }
        if scope == RefreshScope::All {
            self.last_presence = None;
        }
    }

    /// Calls spent by one scheduled cycle: zone states, plus home state when
    /// it is fetched every cycle.
    pub fn predicted_poll_cost(&self) -> f64 {
        if self.intervals.presence.is_zero() { 2.0 } else { 1.0 }
    }

    /// Projected daily spend of the background tracks.
    pub fn estimate_daily_reserved_cost(&self) -> f64 {
        let per_day = |interval: Duration| SECONDS_PER_DAY / interval.as_secs_f64();

        let mut cost = 0.0;
        if !self.intervals.slow.is_zero() {
            let probed = self
                .zones
                .values()
                .filter(|z| z.zone_type != ZoneType::Heating)
                .count();
            cost += (2 + probed) as f64 * per_day(self.intervals.slow);
        }
        if !self.intervals.offset.is_zero() {
            let sensors = self
                .devices
                .values()
                .filter(|d| d.has_temperature_sensor())
                .count();
            cost += sensors as f64 * per_day(self.intervals.offset);
        }
        if !self.intervals.presence.is_zero() {
            cost += per_day(self.intervals.presence);
        }
        cost
    }
}
