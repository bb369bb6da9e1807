mod budget;
mod clock;
mod command;
mod config;
mod coordinator;
mod data;
mod diff;
mod dispatch;
mod error;
mod http;
mod journal;
mod merger;
mod overlay;
mod protocol;
mod queue;
mod remote;
mod schedule;
mod state;
mod types;

pub use budget::{RateBudget, elapsed_fraction};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, CommandKind};
pub use config::{Config, MAX_INTERVAL_S};
pub use coordinator::{Coordinator, CoordinatorBuilder, OverlayRequest, RESUME_REFRESH_DELAY};
pub use data::{DataManager, FetchResult, TrackIntervals};
pub use error::{Error, Result};
pub use http::{DEFAULT_ENERGY_URL, TadoHttpClient, TadoHttpClientBuilder, parse_quota};
pub use journal::JournalMode;
pub use merger::{MergedActions, merge};
pub use overlay::{OptimisticEntry, OptimisticOverlay, OptimisticValue};
pub use protocol::DEFAULT_BASE_URL;
pub use queue::{BATCH_LINGER, BatchHandler, CommandQueue};
pub use remote::{TEMP_OFFSET_ATTR, TadoApi};
pub use schedule::{
    IntervalDecision, IntervalReason, IntervalScheduler, QuotaInputs, ReducedWindow,
    ScheduleConfig, apply_jitter, next_reset_after,
};
pub use state::{ReadState, Rollback, ZoneFlag};
pub use types::*;
