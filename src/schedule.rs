use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use rand::Rng;
use tracing::{debug, warn};

use crate::budget::{RateBudget, elapsed_fraction};
use crate::clock::Clock;
use crate::config::Config;
use crate::{Error, Result};

pub const SECONDS_PER_HOUR: i64 = 3600;
pub const MIN_AUTO_QUOTA_INTERVAL_S: i64 = 45;
pub const MIN_PROXY_INTERVAL_S: i64 = 120;
/// Floor applied to the base interval once the adaptive budget is spent.
const EXHAUSTED_MIN_INTERVAL_S: u64 = 300;

/// The remote quota resets daily at this wall-clock time in `RESET_TIMEZONE`.
pub const RESET_TIMEZONE: Tz = chrono_tz::Europe::Berlin;
pub const RESET_HOUR: u32 = 0;
pub const RESET_MINUTE: u32 = 1;

const PAUSE_LEAD_MINUTES: i64 = 1;
const PAUSE_STEP_MINUTES: i64 = 15;

/// Time-of-day range with a polling interval of its own. `start > end` wraps
/// across midnight; both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReducedWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// 0 pauses polling for the whole window.
    pub interval_s: u64,
}

impl ReducedWindow {
    pub fn parse(start: &str, end: &str, interval_s: u64) -> Result<Self> {
        Ok(Self {
            start: parse_time_of_day(start)?,
            end: parse_time_of_day(end)?,
            interval_s,
        })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

/// Accepts `HH:MM` and `HH:MM:SS`; seconds are ignored.
fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let mut parts = s.trim().split(':');
    let mut next = || -> Result<u32> {
        parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| Error::Config(format!("invalid time of day: {s:?}")))
    };
    let hour = next()?;
    let minute = next()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| Error::Config(format!("invalid time of day: {s:?}")))
}

/// Scheduling policy, fixed for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub base_interval_s: u64,
    pub slow_track_interval_s: u64,
    pub reduced_start: String,
    pub reduced_end: String,
    pub reduced_interval_s: u64,
    pub auto_quota_percent: u32,
    pub throttle_threshold: u32,
    pub jitter_percent: f64,
    pub disable_when_throttled: bool,
    pub proxied: bool,
    pub timezone: Tz,
}

impl From<&Config> for ScheduleConfig {
    fn from(config: &Config) -> Self {
        Self {
            base_interval_s: config.scan_interval_s,
            slow_track_interval_s: config.slow_poll_interval_s,
            reduced_start: config.reduced_polling_start.clone(),
            reduced_end: config.reduced_polling_end.clone(),
            reduced_interval_s: config.reduced_polling_interval_s,
            auto_quota_percent: config.auto_quota_percent,
            throttle_threshold: config.throttle_threshold,
            jitter_percent: config.jitter_percent,
            disable_when_throttled: config.disable_polling_when_throttled,
            proxied: config.is_proxied(),
            timezone: config.local_timezone(),
        }
    }
}

impl ScheduleConfig {
    /// Parsed reduced window, or `None` (logged) when the configured times
    /// are malformed.
    pub fn reduced_window(&self) -> Option<ReducedWindow> {
        match ReducedWindow::parse(&self.reduced_start, &self.reduced_end, self.reduced_interval_s)
        {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "reduced polling window disabled for this cycle");
                None
            }
        }
    }

    fn min_floor(&self) -> i64 {
        if self.proxied {
            MIN_PROXY_INTERVAL_S
        } else {
            MIN_AUTO_QUOTA_INTERVAL_S
        }
    }
}

/// Quota inputs for one scheduling decision.
#[derive(Debug, Clone, Copy)]
pub struct QuotaInputs<'a> {
    pub budget: &'a RateBudget,
    pub background_cost_24h: f64,
    pub predicted_poll_cost: f64,
    pub reduced_logic_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalReason {
    PollingDisabled,
    UnknownQuota,
    SuspendedUntilReset,
    Throttled,
    ReducedPause,
    ReducedWindow,
    BaseInterval,
    BudgetExhausted,
    Adaptive,
    Weighted,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalDecision {
    /// `None` means no automatic polling.
    pub interval: Option<Duration>,
    pub reason: IntervalReason,
}

impl IntervalDecision {
    fn secs(secs: i64, reason: IntervalReason) -> Self {
        Self {
            interval: Some(Duration::from_secs(secs.max(1) as u64)),
            reason,
        }
    }

    /// Interval taken straight from configuration.
    fn configured(secs: u64, reason: IntervalReason) -> Self {
        Self {
            interval: Some(Duration::from_secs(secs.max(1))),
            reason,
        }
    }

    fn never(reason: IntervalReason) -> Self {
        Self {
            interval: None,
            reason,
        }
    }

    pub fn seconds(&self) -> Option<u64> {
        self.interval.map(|d| d.as_secs())
    }
}

/// Next quota reset strictly after `now`.
pub fn next_reset_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.with_timezone(&RESET_TIMEZONE).date_naive();
    let candidate = reset_on(today);
    if candidate > now {
        return candidate;
    }
    reset_on(today.succ_opt().unwrap_or(today))
}

fn reset_on(date: NaiveDate) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(RESET_HOUR, RESET_MINUTE, 0).unwrap_or(NaiveTime::MIN);
    let naive = date.and_time(time);
    match RESET_TIMEZONE.from_local_datetime(&naive).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => naive.and_utc(),
    }
}

/// Perturbs `interval_s` uniformly by up to ±`percent`.
pub fn apply_jitter<R: Rng + ?Sized>(interval_s: f64, percent: f64, rng: &mut R) -> f64 {
    if percent <= 0.0 || interval_s <= 0.0 {
        return interval_s;
    }
    let spread = interval_s * percent / 100.0;
    (interval_s + rng.random_range(-spread..=spread)).max(1.0)
}

pub struct IntervalScheduler {
    config: ScheduleConfig,
    clock: Arc<dyn Clock>,
}

impl IntervalScheduler {
    pub fn new(config: ScheduleConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn next_reset_time(&self) -> DateTime<Utc> {
        next_reset_after(self.clock.now())
    }

    pub fn seconds_until_reset(&self) -> i64 {
        let now = self.clock.now();
        (next_reset_after(now) - now).num_seconds()
    }

    pub fn in_reduced_window(&self, at: DateTime<Utc>, window: &ReducedWindow) -> bool {
        window.contains(at.with_timezone(&self.config.timezone).time())
    }

    /// True when a zero-interval reduced window is active right now.
    pub fn in_paused_window(&self, reduced_logic_enabled: bool) -> bool {
        if !reduced_logic_enabled {
            return false;
        }
        self.config
            .reduced_window()
            .is_some_and(|w| w.interval_s == 0 && self.in_reduced_window(self.clock.now(), &w))
    }

    /// Interval until the next automatic poll, jittered when the deployment
    /// goes through a proxy. A suspend-until-reset interval is never
    /// jittered.
    pub fn next_interval<R: Rng + ?Sized>(
        &self,
        inputs: &QuotaInputs<'_>,
        rng: &mut R,
    ) -> IntervalDecision {
        let decision = self.compute(inputs);
        if !self.config.proxied || decision.reason == IntervalReason::SuspendedUntilReset {
            return decision;
        }
        match decision.interval {
            Some(d) => {
                let jittered = apply_jitter(d.as_secs_f64(), self.config.jitter_percent, rng);
                debug!(base = d.as_secs(), jittered, "applied jitter to interval");
                IntervalDecision {
                    interval: Some(Duration::from_secs_f64(jittered)),
                    reason: decision.reason,
                }
            }
            None => decision,
        }
    }

    /// Raw interval decision, evaluated in strict priority order.
    pub fn compute(&self, inputs: &QuotaInputs<'_>) -> IntervalDecision {
        let cfg = &self.config;
        let budget = inputs.budget;
        let now = self.clock.now();
        let next_reset = next_reset_after(now);
        let seconds_until_reset = (next_reset - now).num_seconds();

        if budget.limit() == 0 {
            return self.base_interval(IntervalReason::UnknownQuota);
        }

        if budget.is_throttled() {
            if cfg.disable_when_throttled {
                warn!(
                    remaining = budget.remaining(),
                    threshold = budget.throttle_threshold(),
                    "throttled, polling suspended until quota reset"
                );
                return IntervalDecision::secs(
                    SECONDS_PER_HOUR.max(seconds_until_reset),
                    IntervalReason::SuspendedUntilReset,
                );
            }
            return IntervalDecision::secs(SECONDS_PER_HOUR, IntervalReason::Throttled);
        }

        let window = if inputs.reduced_logic_enabled {
            cfg.reduced_window()
        } else {
            None
        };

        if let Some(w) = window
            && self.in_reduced_window(now, &w)
        {
            if w.interval_s == 0 {
                let mut probe = now + TimeDelta::minutes(PAUSE_LEAD_MINUTES);
                while self.in_reduced_window(probe, &w) && probe < next_reset {
                    probe += TimeDelta::minutes(PAUSE_STEP_MINUTES);
                }
                let diff = (probe - now).num_seconds();
                debug!(seconds = diff, "in zero-polling window");
                return IntervalDecision::secs(
                    MIN_AUTO_QUOTA_INTERVAL_S.max(diff),
                    IntervalReason::ReducedPause,
                );
            }
            debug!(interval = w.interval_s, "in reduced polling window");
            return IntervalDecision::configured(w.interval_s, IntervalReason::ReducedWindow);
        }

        if cfg.auto_quota_percent == 0 {
            return self.base_interval(IntervalReason::BaseInterval);
        }

        let min_floor = cfg.min_floor();
        let remaining_budget = budget.remaining_budget_for_rest_of_day(
            inputs.background_cost_24h,
            elapsed_fraction(seconds_until_reset),
            f64::from(cfg.auto_quota_percent),
        );

        if remaining_budget <= 0.0 {
            return match cfg.base_interval_s {
                0 => IntervalDecision::never(IntervalReason::BudgetExhausted),
                base => IntervalDecision::configured(
                    base.max(EXHAUSTED_MIN_INTERVAL_S),
                    IntervalReason::BudgetExhausted,
                ),
            };
        }

        let cost = if inputs.predicted_poll_cost.is_finite() && inputs.predicted_poll_cost > 0.0 {
            inputs.predicted_poll_cost
        } else {
            1.0
        };

        match window {
            Some(w) => {
                self.weighted_interval(now, next_reset, remaining_budget, cost, min_floor, &w)
            }
            None => {
                let remaining_polls = remaining_budget / cost;
                if remaining_polls <= 0.0 {
                    return IntervalDecision::secs(SECONDS_PER_HOUR, IntervalReason::Fallback);
                }
                let adaptive = seconds_until_reset as f64 / remaining_polls;
                let clamped = adaptive.min(SECONDS_PER_HOUR as f64).max(min_floor as f64);
                IntervalDecision::secs(clamped as i64, IntervalReason::Adaptive)
            }
        }
    }

    /// Spends the budget left after the reduced window's own consumption on
    /// the normal hours until reset. The result never polls faster than the
    /// reduced window does.
    fn weighted_interval(
        &self,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
        remaining_budget: f64,
        cost: f64,
        min_floor: i64,
        window: &ReducedWindow,
    ) -> IntervalDecision {
        let fallback =
            IntervalDecision::secs(min_floor.max(SECONDS_PER_HOUR), IntervalReason::Fallback);

        let mut normal_seconds: i64 = 0;
        let mut reduced_seconds: i64 = 0;
        let mut probe = now;
        while probe < next_reset {
            let left = (next_reset - probe).num_seconds();
            let chunk = left.min(SECONDS_PER_HOUR).max(min_floor);
            if self.in_reduced_window(probe, window) {
                reduced_seconds += chunk;
            } else {
                normal_seconds += chunk;
            }
            probe += TimeDelta::seconds(chunk);
        }

        let reduced_cost = if window.interval_s == 0 {
            0.0
        } else {
            reduced_seconds as f64 / window.interval_s as f64 * cost
        };
        let normal_budget = (remaining_budget - reduced_cost).max(0.0);

        if normal_budget > 0.0 {
            let normal_polls = normal_budget / cost;
            if normal_polls > 0.0 {
                let adaptive = normal_seconds as f64 / normal_polls;
                let cap = if window.interval_s > 0 {
                    window.interval_s as f64
                } else {
                    SECONDS_PER_HOUR as f64
                };
                let clamped = adaptive.min(cap).max(min_floor as f64);
                if !clamped.is_finite() {
                    warn!("weighted interval calculation produced a non-finite value");
                    return fallback;
                }
                debug!(
                    normal_seconds,
                    reduced_seconds,
                    reduced_cost,
                    interval = clamped,
                    "weighted interval"
                );
                return IntervalDecision::secs(clamped as i64, IntervalReason::Weighted);
            }
        }

        IntervalDecision::secs(SECONDS_PER_HOUR, IntervalReason::Fallback)
    }

    fn base_interval(&self, reason: IntervalReason) -> IntervalDecision {
        match self.config.base_interval_s {
            0 => IntervalDecision::never(reason),
            base => IntervalDecision::configured(base, reason),
        }
    }
}
