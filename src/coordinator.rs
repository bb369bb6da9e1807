use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::budget::RateBudget;
use crate::clock::{Clock, SystemClock};
use crate::command::{Command, CommandKind};
use crate::config::Config;
use crate::data::{DataManager, FetchResult, TrackIntervals};
use crate::dispatch::dispatch;
use crate::journal::{CallJournal, JournalMode};
use crate::merger::{MergedActions, merge};
use crate::overlay::{OptimisticOverlay, OptimisticValue};
use crate::protocol::meter_reading_body;
use crate::queue::{BatchHandler, CommandQueue};
use crate::remote::TadoApi;
use crate::schedule::{
    IntervalDecision, IntervalReason, IntervalScheduler, QuotaInputs, ScheduleConfig,
};
use crate::state::{ReadState, Rollback, ZoneFlag};
use crate::types::*;
use crate::{Error, Result};

/// Delay between a schedule resume and the zone refresh that confirms it.
pub const RESUME_REFRESH_DELAY: Duration = Duration::from_secs(5);

type UpdateCallback = Box<dyn Fn(&Update) + Send + Sync>;

/// Overlay applied to several zones at once.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayRequest {
    pub zone_ids: Vec<ZoneId>,
    pub power: Power,
    pub temperature: Option<f64>,
    pub duration_minutes: Option<u32>,
    pub overlay_mode: Option<OverlayMode>,
}

pub struct CoordinatorBuilder {
    config: Config,
    api: Arc<dyn TadoApi>,
    clock: Arc<dyn Clock>,
    listeners: Vec<UpdateCallback>,
    journal: Option<(JournalMode, PathBuf)>,
    config_path: Option<PathBuf>,
}

impl CoordinatorBuilder {
    pub fn new(config: Config, api: Arc<dyn TadoApi>) -> Self {
        Self {
            config,
            api,
            clock: Arc::new(SystemClock),
            listeners: Vec::new(),
            journal: None,
            config_path: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Update) + Send + Sync + 'static) -> Self {
        self.listeners.push(Box::new(f));
        self
    }

    /// Record outbound writes and confirmed fetches to a JSON-lines file.
    pub fn call_journal(mut self, mode: JournalMode, path: impl Into<PathBuf>) -> Self {
        self.journal = Some((mode, path.into()));
        self
    }

    /// Where toggles that outlive the process (reduced polling logic) are
    /// written back.
    pub fn persist_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;

        let journal = match self.journal {
            Some((mode, path)) => Some(Mutex::new(CallJournal::open(mode, path)?)),
            None => None,
        };

        let data = DataManager::new(Arc::clone(&self.api), TrackIntervals::from(&self.config));
        let shared = Shared {
            read: ReadState::default(),
            optimistic: OptimisticOverlay::new(),
            budget: RateBudget::new(self.config.throttle_threshold),
            polling_enabled: true,
            reduced_logic_enabled: self.config.reduced_polling_active,
            last_decision: None,
            background_cost: data.estimate_daily_reserved_cost(),
            predicted_cost: data.predicted_poll_cost(),
        };

        let scheduler = IntervalScheduler::new(
            ScheduleConfig::from(&self.config),
            Arc::clone(&self.clock),
        );
        let queue = CommandQueue::new(Duration::from_secs(self.config.debounce_s));

        Ok(Coordinator {
            inner: Arc::new(Inner {
                config: self.config,
                api: self.api,
                clock: self.clock,
                scheduler,
                queue,
                shared: Mutex::new(shared),
                fetch: tokio::sync::Mutex::new(data),
                listeners: self.listeners,
                journal,
                config_path: self.config_path,
                poll_wake: Arc::new(Notify::new()),
                tasks: Mutex::new(Tasks::default()),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct Shared {
    read: ReadState,
    optimistic: OptimisticOverlay,
    budget: RateBudget,
    polling_enabled: bool,
    reduced_logic_enabled: bool,
    last_decision: Option<IntervalDecision>,
    background_cost: f64,
    predicted_cost: f64,
}

impl Shared {
    /// Replaces confirmed state. Entries whose command is still debouncing
    /// cannot be confirmed yet and only age out.
    fn apply_fetch(
        &mut self,
        result: FetchResult,
        now: DateTime<Utc>,
        ttl: TimeDelta,
        unsent: &HashSet<ResourceKey>,
    ) -> usize {
        let Shared { read, optimistic, .. } = self;
        if let Some(home) = result.home {
            read.home = Some(home);
        }
        read.zone_states = result.zone_states;
        read.zones = result.zones;
        read.devices = result.devices;
        read.capabilities = result.capabilities;
        read.offsets = result.offsets;
        read.away_temps = result.away_temps;
        optimistic.cleanup(now, ttl, |key, value| {
            !unsent.contains(key) && read.confirms(key, value)
        })
    }

    fn sync_quota(&mut self, quota: Option<RateLimit>) {
        if let Some(q) = quota {
            self.budget.sync_from_response(q.limit, q.remaining);
        }
        self.read.rate_limit = self.budget.rate_limit();
    }
}

#[derive(Default)]
struct Tasks {
    poll: Option<JoinHandle<()>>,
    reset: Option<JoinHandle<()>>,
    resume_refresh: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [self.poll.take(), self.reset.take(), self.resume_refresh.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    config: Config,
    api: Arc<dyn TadoApi>,
    clock: Arc<dyn Clock>,
    scheduler: IntervalScheduler,
    queue: CommandQueue,
    shared: Mutex<Shared>,
    /// Also the in-flight guard shared by every fetch trigger.
    fetch: tokio::sync::Mutex<DataManager>,
    listeners: Vec<UpdateCallback>,
    journal: Option<Mutex<CallJournal>>,
    config_path: Option<PathBuf>,
    poll_wake: Arc<Notify>,
    tasks: Mutex<Tasks>,
    closed: AtomicBool,
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, update: &Update) {
        for cb in &self.listeners {
            cb(update);
        }
    }

    fn notify_rate_limit(&self) {
        let (rate_limit, status) = {
            let s = self.shared();
            (s.budget.rate_limit(), s.budget.api_status())
        };
        self.notify(&Update::RateLimit { rate_limit, status });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn next_interval(&self) -> IntervalDecision {
        let mut s = self.shared();
        s.budget.daily_reset_time = Some(self.scheduler.next_reset_time());

        let decision = if s.polling_enabled {
            let predicted = if s.budget.last_poll_cost > 0.0 {
                s.budget.last_poll_cost
            } else {
                s.predicted_cost
            };
            let inputs = QuotaInputs {
                budget: &s.budget,
                background_cost_24h: s.background_cost,
                predicted_poll_cost: predicted,
                reduced_logic_enabled: s.reduced_logic_enabled,
            };
            self.scheduler.next_interval(&inputs, &mut rand::rng())
        } else {
            IntervalDecision {
                interval: None,
                reason: IntervalReason::PollingDisabled,
            }
        };

        if s.last_decision != Some(decision) {
            debug!(
                interval_s = decision.seconds(),
                reason = ?decision.reason,
                "poll interval updated"
            );
        }
        s.last_decision = Some(decision);
        decision
    }

    /// Scheduled or caller-triggered fetch. Returns `Ok(false)` when the
    /// fetch was skipped, either by the gates or because another fetch is
    /// already in flight.
    async fn refresh(&self, force: bool) -> Result<bool> {
        let Ok(mut data) = self.fetch.try_lock() else {
            debug!("fetch already in flight, skipping");
            return Ok(false);
        };
        self.refresh_locked(&mut data, force).await
    }

    fn should_skip(&self, force: bool) -> Option<&'static str> {
        if force {
            return None;
        }
        let s = self.shared();
        if s.read.is_empty() {
            return None;
        }
        if !s.polling_enabled {
            return Some("polling disabled");
        }
        if self.scheduler.in_paused_window(s.reduced_logic_enabled) {
            return Some("inside paused reduced window");
        }
        if self.config.disable_polling_when_throttled
            && s.budget.limit() > 0
            && s.budget.is_throttled()
        {
            return Some("throttled");
        }
        None
    }

    async fn refresh_locked(&self, data: &mut DataManager, force: bool) -> Result<bool> {
        if let Some(reason) = self.should_skip(force) {
            debug!(reason, "skipping fetch, keeping cached data");
            return Ok(false);
        }

        let quota_before = {
            let s = self.shared();
            (s.budget.limit() > 0).then(|| s.budget.remaining())
        };

        let result = match data.fetch_full_update().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "update failed, keeping last good state");
                self.notify(&Update::RefreshFailed {
                    reason: e.to_string(),
                });
                return Err(Error::UpdateFailed(e.to_string()));
            }
        };

        let background = data.estimate_daily_reserved_cost();
        let predicted = data.predicted_poll_cost();
        let quota = self.api.quota();
        let now = self.clock.now();
        let ttl = self.config.optimistic_ttl();
        let unsent = self.queue.pending_keys();

        let snapshot = {
            let mut s = self.shared();
            let cleared = s.apply_fetch(result, now, ttl, &unsent);
            if cleared > 0 {
                debug!(cleared, "optimistic entries settled");
            }
            s.sync_quota(quota);
            if let Some(before) = quota_before {
                let cost = f64::from(before) - f64::from(s.budget.remaining());
                if cost > 0.0 {
                    s.budget.last_poll_cost = cost;
                }
            }
            s.background_cost = background;
            s.predicted_cost = predicted;
            self.journal.as_ref().map(|_| serde_json::to_value(&s.read))
        };

        if let (Some(journal), Some(snapshot)) = (self.journal.as_ref(), snapshot) {
            match snapshot {
                Ok(v) => journal.lock().unwrap_or_else(|e| e.into_inner()).log_fetch(&v),
                Err(e) => warn!(error = %e, "failed to serialize snapshot for journal"),
            }
        }

        self.notify(&Update::Refreshed);
        self.notify_rate_limit();
        Ok(true)
    }

    async fn process_batch(&self, batch: Vec<Command>) {
        let started_at = self.clock.now();
        let merged = merge(&batch);
        if merged.is_empty() {
            return;
        }

        let report = dispatch(self.api.as_ref(), &merged, self.journal.as_ref()).await;
        info!(
            commands = merged.command_count,
            calls = report.calls,
            failed = report.failed.len(),
            "batch dispatched"
        );

        let quota = self.api.quota();
        self.shared().sync_quota(quota);

        if merged.has_manual_poll() {
            let mut data = self.fetch.lock().await;
            for scope in &merged.manual_poll {
                data.invalidate_cache(*scope);
            }
            if let Err(e) = self.refresh_locked(&mut data, true).await {
                warn!(error = %e, "manual poll failed");
            }
        } else {
            let mut s = self.shared();
            if s.budget.limit() > 0 && s.budget.is_throttled() {
                s.budget.decrement(merged.command_count as u32);
                s.read.rate_limit = s.budget.rate_limit();
            }
        }

        if self.config.rollback_on_failure && !report.failed.is_empty() {
            self.roll_back(&merged, &report.failed, started_at);
        }

        self.notify_rate_limit();
    }

    /// Restores cached state for failed keys whose optimistic entry predates
    /// the batch. Entries written after the batch started belong to a newer
    /// command and are left alone.
    fn roll_back(&self, merged: &MergedActions, failed: &[ResourceKey], started_at: DateTime<Utc>) {
        let mut restored = Vec::new();
        {
            let mut s = self.shared();
            for key in failed {
                let Some(rollback) = merged.rollbacks.get(key) else {
                    continue;
                };
                let stale = s
                    .optimistic
                    .entry(key)
                    .is_some_and(|e| e.created_at <= started_at);
                if !stale {
                    continue;
                }
                s.read.restore(rollback.clone());
                s.optimistic.clear(key);
                restored.push(key.clone());
            }
        }
        if !restored.is_empty() {
            warn!(keys = ?restored, "rolled back failed writes");
            self.notify(&Update::Optimistic { keys: restored });
        }
    }

    fn arm_resume_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut tasks = self.tasks();
        if let Some(prev) = tasks.resume_refresh.take() {
            prev.abort();
        }
        tasks.resume_refresh = Some(tokio::spawn(async move {
            tokio::time::sleep(RESUME_REFRESH_DELAY).await;
            if let Some(inner) = weak.upgrade() {
                debug!("requesting zone refresh after resume");
                inner.queue.enqueue(Command::with_key(
                    ResourceKey::ResumeRefresh,
                    CommandKind::ManualPoll(RefreshScope::Zone),
                ));
            }
        }));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.tasks().abort_all();
    }
}

struct WorkerLink(Weak<Inner>);

#[async_trait]
impl BatchHandler for WorkerLink {
    async fn process(&self, batch: Vec<Command>) {
        if let Some(inner) = self.0.upgrade() {
            inner.process_batch(batch).await;
        }
    }
}

async fn poll_loop(weak: Weak<Inner>) {
    loop {
        let (decision, wake) = {
            let Some(inner) = weak.upgrade() else { return };
            (inner.next_interval(), Arc::clone(&inner.poll_wake))
        };
        match decision.interval {
            Some(interval) => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(inner) = weak.upgrade() else { return };
                        // failures are logged and reported to listeners
                        let _ = inner.refresh(false).await;
                    }
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
}

async fn reset_loop(weak: Weak<Inner>) {
    loop {
        let delay = {
            let Some(inner) = weak.upgrade() else { return };
            let now = inner.clock.now();
            let until = (inner.scheduler.next_reset_time() - now)
                .to_std()
                .unwrap_or_default();
            until + Duration::from_secs(1)
        };
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else { return };
        info!("quota reset passed, forcing refresh");
        if let Err(e) = inner.refresh(true).await {
            warn!(error = %e, "post-reset refresh failed");
        }
        inner.poll_wake.notify_one();
    }
}

/// Entry point for callers. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn builder(config: Config, api: Arc<dyn TadoApi>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config, api)
    }

    /// Starts the batch worker, the poll loop and the quota reset timer,
    /// then runs the first fetch.
    pub async fn start(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.start(Arc::new(WorkerLink(weak.clone())));

        let first = self.inner.refresh(true).await;
        {
            let mut tasks = self.inner.tasks();
            if tasks.poll.is_none() {
                tasks.poll = Some(tokio::spawn(poll_loop(weak.clone())));
            }
            if tasks.reset.is_none() {
                tasks.reset = Some(tokio::spawn(reset_loop(weak)));
            }
        }
        first.map(|_| ())
    }

    /// Cancels every timer and background task. Pending writes are dropped.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("coordinator shutting down");
        self.inner.queue.shutdown();
        self.inner.tasks().abort_all();
    }

    /// Runs a fetch through the same gates as the poll loop.
    pub async fn refresh(&self) -> Result<bool> {
        self.inner.ensure_open()?;
        self.inner.refresh(false).await
    }

    fn submit(
        &self,
        kind: CommandKind,
        optimistic: Option<OptimisticValue>,
        patch: impl FnOnce(&mut ReadState) -> Option<Rollback>,
    ) -> Result<()> {
        self.inner.ensure_open()?;
        let key = kind.resource_key();
        let now = self.inner.clock.now();
        let rollback = {
            let mut s = self.inner.shared();
            if let Some(value) = optimistic {
                s.optimistic.set(key.clone(), value, now);
            }
            patch(&mut s.read)
        };
        self.inner.notify(&Update::Optimistic {
            keys: vec![key.clone()],
        });

        let mut command = Command::with_key(key, kind);
        if let Some(rb) = rollback {
            command = command.rollback(rb);
        }
        self.inner.queue.enqueue(command);
        Ok(())
    }

    fn zone_type_of(read: &ReadState, zone: ZoneId) -> Result<ZoneType> {
        match read.zone_type(zone) {
            Some(t) => Ok(t),
            None if read.zones.is_empty() => Ok(ZoneType::Heating),
            None => Err(Error::InvalidZone(zone)),
        }
    }

    fn build_overlay(
        &self,
        zone: ZoneId,
        power: Power,
        temperature: Option<f64>,
        duration_minutes: Option<u32>,
        mode: Option<OverlayMode>,
    ) -> Result<ZoneOverlay> {
        let s = self.inner.shared();
        let zone_type = Self::zone_type_of(&s.read, zone)?;
        // Heating zones are never probed and always take a temperature.
        let supports_temperature = zone_type == ZoneType::Heating
            || s
                .read
                .capabilities
                .get(&zone)
                .is_some_and(|c| c.supports_temperature());

        let temperature = match temperature {
            Some(_) if power == Power::Off => {
                warn!(zone, "temperature ignored for power off");
                None
            }
            Some(_) if !supports_temperature => {
                warn!(zone, "zone does not support a target temperature, ignoring it");
                None
            }
            Some(t) => {
                let max = zone_type.max_temperature();
                if t > max {
                    warn!(zone, requested = t, max, "temperature capped");
                }
                let t = t.min(max);
                Some(if zone_type == ZoneType::HotWater { t.round() } else { t })
            }
            None => None,
        };

        Ok(ZoneOverlay {
            setting: OverlaySetting {
                zone_type,
                power,
                temperature,
            },
            termination: Termination::resolve(mode, duration_minutes),
        })
    }

    fn submit_overlay(&self, zone: ZoneId, overlay: ZoneOverlay) -> Result<()> {
        self.submit(
            CommandKind::SetOverlay { zone, overlay },
            Some(OptimisticValue::Zone {
                overlay_active: true,
                power: Some(overlay.setting.power),
                temperature: overlay.setting.temperature,
            }),
            |read| Some(read.patch_zone_overlay(zone, Some(overlay))),
        )
    }

    pub fn set_zone_overlay(
        &self,
        zone: ZoneId,
        power: Power,
        temperature: Option<f64>,
        duration_minutes: Option<u32>,
        mode: Option<OverlayMode>,
    ) -> Result<()> {
        let overlay = self.build_overlay(zone, power, temperature, duration_minutes, mode)?;
        self.submit_overlay(zone, overlay)
    }

    /// Applies one overlay to several zones. Every zone is validated before
    /// anything is queued.
    pub fn set_multiple_zone_overlays(&self, request: &OverlayRequest) -> Result<()> {
        let overlays = request
            .zone_ids
            .iter()
            .map(|&zone| {
                self.build_overlay(
                    zone,
                    request.power,
                    request.temperature,
                    request.duration_minutes,
                    request.overlay_mode,
                )
                .map(|o| (zone, o))
            })
            .collect::<Result<Vec<_>>>()?;
        for (zone, overlay) in overlays {
            self.submit_overlay(zone, overlay)?;
        }
        Ok(())
    }

    pub fn set_zone_hvac_mode(
        &self,
        zone: ZoneId,
        mode: HvacMode,
        temperature: Option<f64>,
        duration_minutes: Option<u32>,
        overlay_mode: Option<OverlayMode>,
    ) -> Result<()> {
        match mode {
            HvacMode::Auto => self.set_zone_auto(zone),
            HvacMode::Off => {
                self.set_zone_overlay(zone, Power::Off, None, duration_minutes, overlay_mode)
            }
            HvacMode::Heat => {
                self.set_zone_overlay(zone, Power::On, temperature, duration_minutes, overlay_mode)
            }
        }
    }

    /// Returns the zone to its schedule.
    pub fn set_zone_auto(&self, zone: ZoneId) -> Result<()> {
        Self::zone_type_of(&self.inner.shared().read, zone)?;
        self.submit(
            CommandKind::ResumeSchedule { zone },
            Some(OptimisticValue::Zone {
                overlay_active: false,
                power: None,
                temperature: None,
            }),
            |read| Some(read.patch_zone_overlay(zone, None)),
        )?;
        if self.inner.config.refresh_after_resume {
            self.inner.arm_resume_refresh();
        }
        Ok(())
    }

    pub fn set_zone_heat(&self, zone: ZoneId, temperature: Option<f64>) -> Result<()> {
        self.set_zone_overlay(
            zone,
            Power::On,
            Some(temperature.unwrap_or(BOOST_TEMPERATURE_C)),
            None,
            Some(OverlayMode::Manual),
        )
    }

    pub fn set_zone_off(&self, zone: ZoneId) -> Result<()> {
        self.set_zone_overlay(zone, Power::Off, None, None, Some(OverlayMode::Manual))
    }

    pub fn set_hot_water_auto(&self, zone: ZoneId) -> Result<()> {
        self.set_zone_auto(zone)
    }

    pub fn set_hot_water_off(&self, zone: ZoneId) -> Result<()> {
        self.set_zone_off(zone)
    }

    /// Turns hot water on, keeping the current target when none is given.
    pub fn set_hot_water_heat(&self, zone: ZoneId, temperature: Option<f64>) -> Result<()> {
        let temperature = temperature.or_else(|| {
            self.inner
                .shared()
                .read
                .zone_states
                .get(&zone)
                .and_then(|s| s.setting.temperature)
        });
        self.set_zone_overlay(zone, Power::On, temperature, None, Some(OverlayMode::Manual))
    }

    pub fn set_hot_water_power(&self, zone: ZoneId, on: bool) -> Result<()> {
        let power = if on { Power::On } else { Power::Off };
        self.set_zone_overlay(zone, power, None, None, Some(OverlayMode::Manual))
    }

    /// Heating zones not excluded by `disabled_zones`.
    pub fn active_zones(&self) -> Vec<ZoneId> {
        self.inner
            .shared()
            .read
            .zones
            .values()
            .filter(|z| z.zone_type == ZoneType::Heating)
            .filter(|z| !self.inner.config.disabled_zones.contains(&z.id))
            .map(|z| z.id)
            .collect()
    }

    fn for_active_zones(&self, action: &str, f: impl Fn(ZoneId) -> Result<()>) -> Result<()> {
        let zones = self.active_zones();
        if zones.is_empty() {
            warn!(action, "no active heating zones");
            return Ok(());
        }
        info!(action, count = zones.len(), "applying to all active zones");
        for zone in zones {
            f(zone)?;
        }
        Ok(())
    }

    pub fn resume_all_schedules(&self) -> Result<()> {
        self.for_active_zones("resume_all", |z| self.set_zone_auto(z))
    }

    pub fn turn_off_all_zones(&self) -> Result<()> {
        self.for_active_zones("turn_off_all", |z| self.set_zone_off(z))
    }

    pub fn boost_all_zones(&self) -> Result<()> {
        self.for_active_zones("boost_all", |z| {
            self.set_zone_overlay(
                z,
                Power::On,
                Some(BOOST_TEMPERATURE_C),
                None,
                Some(OverlayMode::Manual),
            )
        })
    }

    pub fn set_presence(&self, presence: Presence) -> Result<()> {
        self.submit(
            CommandKind::SetPresence(presence),
            Some(OptimisticValue::Presence(presence)),
            |read| Some(read.patch_presence(presence)),
        )
    }

    pub fn set_child_lock(&self, serial: &str, enabled: bool) -> Result<()> {
        self.submit(
            CommandKind::SetChildLock {
                serial: serial.to_string(),
                enabled,
            },
            Some(OptimisticValue::Flag(enabled)),
            |read| Some(read.patch_child_lock(serial, enabled)),
        )
    }

    pub fn set_temperature_offset(&self, serial: &str, offset: f64) -> Result<()> {
        self.submit(
            CommandKind::SetOffset {
                serial: serial.to_string(),
                offset,
            },
            Some(OptimisticValue::Temperature(offset)),
            |read| Some(read.patch_offset(serial, offset)),
        )
    }

    pub fn set_away_temperature(&self, zone: ZoneId, temperature: f64) -> Result<()> {
        self.submit(
            CommandKind::SetAwayTemp { zone, temperature },
            Some(OptimisticValue::Temperature(temperature)),
            |read| Some(read.patch_away_temp(zone, temperature)),
        )
    }

    fn set_zone_flag(&self, zone: ZoneId, flag: ZoneFlag, enabled: bool) -> Result<()> {
        let kind = match flag {
            ZoneFlag::Dazzle => CommandKind::SetDazzle { zone, enabled },
            ZoneFlag::EarlyStart => CommandKind::SetEarlyStart { zone, enabled },
            ZoneFlag::OpenWindow => CommandKind::SetOpenWindow { zone, enabled },
        };
        self.submit(kind, Some(OptimisticValue::Flag(enabled)), |read| {
            Some(read.patch_zone_flag(zone, flag, enabled))
        })
    }

    pub fn set_dazzle_mode(&self, zone: ZoneId, enabled: bool) -> Result<()> {
        self.set_zone_flag(zone, ZoneFlag::Dazzle, enabled)
    }

    pub fn set_early_start(&self, zone: ZoneId, enabled: bool) -> Result<()> {
        self.set_zone_flag(zone, ZoneFlag::EarlyStart, enabled)
    }

    pub fn set_open_window_detection(&self, zone: ZoneId, enabled: bool) -> Result<()> {
        self.set_zone_flag(zone, ZoneFlag::OpenWindow, enabled)
    }

    pub fn identify_device(&self, serial: &str) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.queue.enqueue(Command::new(CommandKind::Identify {
            serial: serial.to_string(),
        }));
        Ok(())
    }

    /// Queues a refresh of `scope`. It runs after the batch it lands in.
    pub fn manual_poll(&self, scope: RefreshScope) -> Result<()> {
        self.inner.ensure_open()?;
        info!(scope = scope.as_str(), "manual poll requested");
        self.inner
            .queue
            .enqueue(Command::new(CommandKind::ManualPoll(scope)));
        Ok(())
    }

    /// Sent immediately; the reading is not debounced.
    pub async fn add_meter_reading(&self, reading: u32, date: Option<NaiveDate>) -> Result<()> {
        self.inner.ensure_open()?;
        let result = self.inner.api.add_meter_reading(reading, date).await;
        if let Some(journal) = &self.inner.journal {
            journal.lock().unwrap_or_else(|e| e.into_inner()).log_call(
                "add_meter_reading",
                None,
                &meter_reading_body(reading, date),
                result.is_ok(),
            );
        }
        let quota = self.inner.api.quota();
        self.inner.shared().sync_quota(quota);
        result
    }

    /// Turning polling back on fetches immediately.
    pub async fn set_polling_active(&self, enabled: bool) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.shared().polling_enabled = enabled;
        info!(enabled, "polling toggled");
        self.inner.notify(&Update::PollingChanged { enabled });
        let result = if enabled {
            self.inner.refresh(true).await.map(|_| ())
        } else {
            Ok(())
        };
        self.inner.poll_wake.notify_one();
        result
    }

    /// Toggles the reduced window and persists the choice when a config
    /// path was given.
    pub fn set_reduced_polling_logic(&self, enabled: bool) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.shared().reduced_logic_enabled = enabled;
        info!(enabled, "reduced polling logic toggled");
        if let Some(path) = &self.inner.config_path {
            let mut config = self.inner.config.clone();
            config.reduced_polling_active = enabled;
            config.save(path)?;
        }
        self.inner.poll_wake.notify_one();
        Ok(())
    }

    /// Inbound port for writes made outside this crate.
    pub fn notify_external_change(&self, change: ExternalChange) -> Result<()> {
        match change {
            ExternalChange::ResumeRequested(zone) => self.set_zone_auto(zone),
            ExternalChange::ManualOverride(zone) => {
                self.inner.ensure_open()?;
                let key = ResourceKey::Zone(zone);
                let now = self.inner.clock.now();
                self.inner.shared().optimistic.set(
                    key.clone(),
                    OptimisticValue::Zone {
                        overlay_active: true,
                        power: None,
                        temperature: None,
                    },
                    now,
                );
                debug!(zone, "external manual override recorded");
                self.inner.notify(&Update::Optimistic { keys: vec![key] });
                Ok(())
            }
        }
    }

    /// Confirmed state with pending writes layered on top.
    pub fn zone_state(&self, zone: ZoneId) -> Option<ZoneState> {
        let s = self.inner.shared();
        s.read.merged_zone_state(&s.optimistic, zone)
    }

    pub fn presence(&self) -> Option<Presence> {
        let s = self.inner.shared();
        s.read.merged_presence(&s.optimistic)
    }

    pub fn child_lock(&self, serial: &str) -> Option<bool> {
        let s = self.inner.shared();
        s.read.merged_child_lock(&s.optimistic, serial)
    }

    pub fn temperature_offset(&self, serial: &str) -> Option<f64> {
        let s = self.inner.shared();
        s.read.merged_offset(&s.optimistic, serial)
    }

    pub fn away_temperature(&self, zone: ZoneId) -> Option<f64> {
        let s = self.inner.shared();
        s.read.merged_away_temp(&s.optimistic, zone)
    }

    pub fn zone_flag(&self, zone: ZoneId, flag: ZoneFlag) -> Option<bool> {
        let s = self.inner.shared();
        s.read.merged_zone_flag(&s.optimistic, zone, flag)
    }

    /// Confirmed state only, including local patches from writes.
    pub fn read_state(&self) -> ReadState {
        self.inner.shared().read.clone()
    }

    pub fn optimistic_len(&self) -> usize {
        self.inner.shared().optimistic.len()
    }

    pub fn budget(&self) -> RateBudget {
        self.inner.shared().budget.clone()
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.inner.shared().budget.rate_limit()
    }

    pub fn api_status(&self) -> ApiStatus {
        self.inner.shared().budget.api_status()
    }

    pub fn polling_enabled(&self) -> bool {
        self.inner.shared().polling_enabled
    }

    pub fn reduced_polling_logic(&self) -> bool {
        self.inner.shared().reduced_logic_enabled
    }

    /// Decision the poll loop is currently sleeping on.
    pub fn last_interval(&self) -> Option<IntervalDecision> {
        self.inner.shared().last_decision
    }

    /// Computes a fresh interval decision from the current budget.
    pub fn next_interval(&self) -> IntervalDecision {
        self.inner.next_interval()
    }

    pub fn next_reset_time(&self) -> DateTime<Utc> {
        self.inner.scheduler.next_reset_time()
    }

    pub fn pending_commands(&self) -> usize {
        self.inner.queue.pending_len()
    }
}
