use chrono::{DateTime, Utc};

use crate::types::{ApiStatus, RateLimit};

pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Remote API quota as last reported (or locally estimated).
///
/// `remaining <= limit` always holds; `is_throttled()` is true whenever
/// `remaining <= throttle_threshold`.
#[derive(Debug, Clone, PartialEq)]
pub struct RateBudget {
    limit: u32,
    remaining: u32,
    throttle_threshold: u32,
    /// Quota consumed by the most recent full fetch, 0 until measured.
    pub last_poll_cost: f64,
    /// Next instant at which the remote quota resets.
    pub daily_reset_time: Option<DateTime<Utc>>,
}

impl RateBudget {
    pub fn new(throttle_threshold: u32) -> Self {
        Self {
            limit: 0,
            remaining: 0,
            throttle_threshold,
            last_poll_cost: 0.0,
            daily_reset_time: None,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn throttle_threshold(&self) -> u32 {
        self.throttle_threshold
    }

    /// Authoritative update from response headers.
    pub fn sync_from_response(&mut self, limit: u32, remaining: u32) {
        self.limit = limit;
        self.remaining = remaining.min(limit);
    }

    /// Local estimate when no quota headers are available.
    pub fn decrement(&mut self, n: u32) {
        self.remaining = self.remaining.saturating_sub(n);
    }

    pub fn is_throttled(&self) -> bool {
        self.remaining <= self.throttle_threshold
    }

    pub fn rate_limit(&self) -> RateLimit {
        RateLimit {
            limit: self.limit,
            remaining: self.remaining,
        }
    }

    /// Status for display. An unknown limit (nothing synced yet) reads as
    /// connected.
    pub fn api_status(&self) -> ApiStatus {
        if self.limit == 0 {
            ApiStatus::Connected
        } else if self.remaining == 0 {
            ApiStatus::RateLimited
        } else if self.is_throttled() {
            ApiStatus::Throttled
        } else {
            ApiStatus::Connected
        }
    }

    /// Quota the adaptive scheduler may still spend before the next reset.
    ///
    /// `background_cost_24h` is the projected daily cost of non-interactive
    /// tracks. Calls made so far beyond the expected background share count
    /// as user activity; user activity above the throttle threshold shrinks
    /// the pool. The pool is scaled by `auto_quota_percent` and by the share
    /// of the day still ahead.
    pub fn remaining_budget_for_rest_of_day(
        &self,
        background_cost_24h: f64,
        elapsed_fraction: f64,
        auto_quota_percent: f64,
    ) -> f64 {
        let background = clamp_non_negative(background_cost_24h);
        let elapsed = clamp_non_negative(elapsed_fraction).min(1.0);
        let percent = clamp_non_negative(auto_quota_percent);

        let limit = f64::from(self.limit);
        let used_total = f64::from(self.limit - self.remaining);
        let expected_background_so_far = background * elapsed;
        let user_calls_so_far = (used_total - expected_background_so_far).max(0.0);
        let user_excess = (user_calls_so_far - f64::from(self.throttle_threshold)).max(0.0);

        let available_for_day = (limit - background - user_excess).max(0.0);
        let auto_budget = available_for_day * percent / 100.0;
        (auto_budget * (1.0 - elapsed)).max(0.0)
    }
}

fn clamp_non_negative(v: f64) -> f64 {
    if v.is_finite() { v.max(0.0) } else { 0.0 }
}

/// Fraction of the quota day already elapsed, given the seconds left until
/// the next reset.
pub fn elapsed_fraction(seconds_until_reset: i64) -> f64 {
    let left = (seconds_until_reset as f64).clamp(0.0, SECONDS_PER_DAY);
    (SECONDS_PER_DAY - left) / SECONDS_PER_DAY
}
