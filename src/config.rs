use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::TimeDelta;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::types::ZoneId;
use crate::{Error, Result};

/// Upper bound for every interval and TTL setting.
pub const MAX_INTERVAL_S: u64 = 86_400;

/// Runtime configuration. Every field has a default so a partial TOML file is
/// enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base poll interval; 0 disables automatic polling.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_s: u64,
    #[serde(default = "default_slow_poll_interval")]
    pub slow_poll_interval_s: u64,
    /// 0 fetches offsets only on explicit invalidation.
    #[serde(default)]
    pub offset_poll_interval_s: u64,
    /// 0 fetches home state every cycle.
    #[serde(default)]
    pub presence_poll_interval_s: u64,
    #[serde(default = "default_debounce")]
    pub debounce_s: u64,
    #[serde(default = "default_throttle_threshold")]
    pub throttle_threshold: u32,
    /// Share of the daily quota the adaptive scheduler may spend; 0 disables
    /// adaptive polling.
    #[serde(default = "default_auto_quota_percent")]
    pub auto_quota_percent: u32,
    #[serde(default)]
    pub reduced_polling_active: bool,
    #[serde(default = "default_reduced_start")]
    pub reduced_polling_start: String,
    #[serde(default = "default_reduced_end")]
    pub reduced_polling_end: String,
    /// 0 pauses polling for the whole window.
    #[serde(default = "default_reduced_interval")]
    pub reduced_polling_interval_s: u64,
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: f64,
    #[serde(default)]
    pub api_proxy_url: Option<String>,
    #[serde(default = "default_true")]
    pub refresh_after_resume: bool,
    #[serde(default)]
    pub disable_polling_when_throttled: bool,
    #[serde(default = "default_optimistic_ttl")]
    pub optimistic_ttl_s: u64,
    /// IANA zone used for the reduced polling window.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub disabled_zones: Vec<ZoneId>,
    #[serde(default)]
    pub rollback_on_failure: bool,
}

fn default_scan_interval() -> u64 {
    3600
}

fn default_slow_poll_interval() -> u64 {
    86_400
}

fn default_debounce() -> u64 {
    5
}

fn default_throttle_threshold() -> u32 {
    20
}

fn default_auto_quota_percent() -> u32 {
    80
}

fn default_reduced_start() -> String {
    "22:00".into()
}

fn default_reduced_end() -> String {
    "07:00".into()
}

fn default_reduced_interval() -> u64 {
    3600
}

fn default_jitter_percent() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_optimistic_ttl() -> u64 {
    300
}

fn default_timezone() -> String {
    "Europe/Berlin".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_interval_s: default_scan_interval(),
            slow_poll_interval_s: default_slow_poll_interval(),
            offset_poll_interval_s: 0,
            presence_poll_interval_s: 0,
            debounce_s: default_debounce(),
            throttle_threshold: default_throttle_threshold(),
            auto_quota_percent: default_auto_quota_percent(),
            reduced_polling_active: false,
            reduced_polling_start: default_reduced_start(),
            reduced_polling_end: default_reduced_end(),
            reduced_polling_interval_s: default_reduced_interval(),
            jitter_percent: default_jitter_percent(),
            api_proxy_url: None,
            refresh_after_resume: true,
            disable_polling_when_throttled: false,
            optimistic_ttl_s: default_optimistic_ttl(),
            timezone: default_timezone(),
            disabled_zones: Vec::new(),
            rollback_on_failure: false,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        fs::write(path.as_ref(), raw)?;
        Ok(())
    }

    /// Range checks. Reduced-window times are parsed per scheduling cycle
    /// instead, where a bad value only disables the window.
    pub fn validate(&self) -> Result<()> {
        if self.auto_quota_percent > 100 {
            return Err(Error::Config(format!(
                "auto_quota_percent must be 0..=100, got {}",
                self.auto_quota_percent
            )));
        }
        if !(0.0..=50.0).contains(&self.jitter_percent) {
            return Err(Error::Config(format!(
                "jitter_percent must be 0..=50, got {}",
                self.jitter_percent
            )));
        }
        if self.slow_poll_interval_s == 0 {
            return Err(Error::Config("slow_poll_interval_s must be > 0".into()));
        }
        if self.debounce_s > 300 {
            return Err(Error::Config(format!(
                "debounce_s must be <= 300, got {}",
                self.debounce_s
            )));
        }
        for (name, value) in [
            ("scan_interval_s", self.scan_interval_s),
            ("slow_poll_interval_s", self.slow_poll_interval_s),
            ("offset_poll_interval_s", self.offset_poll_interval_s),
            ("presence_poll_interval_s", self.presence_poll_interval_s),
            ("reduced_polling_interval_s", self.reduced_polling_interval_s),
            ("optimistic_ttl_s", self.optimistic_ttl_s),
        ] {
            if value > MAX_INTERVAL_S {
                return Err(Error::Config(format!(
                    "{name} must be <= {MAX_INTERVAL_S}, got {value}"
                )));
            }
        }
        Tz::from_str(&self.timezone)
            .map_err(|_| Error::Config(format!("unknown timezone: {}", self.timezone)))?;
        Ok(())
    }

    /// Age after which an unconfirmed optimistic entry is dropped.
    pub fn optimistic_ttl(&self) -> TimeDelta {
        i64::try_from(self.optimistic_ttl_s.min(MAX_INTERVAL_S))
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or_else(|| TimeDelta::seconds(300))
    }

    pub fn is_proxied(&self) -> bool {
        self.api_proxy_url.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Configured local timezone, falling back to UTC when the name is not
    /// recognized.
    pub fn local_timezone(&self) -> Tz {
        Tz::from_str(&self.timezone).unwrap_or(Tz::UTC)
    }
}
