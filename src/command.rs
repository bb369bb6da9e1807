use uuid::Uuid;

use crate::state::Rollback;
use crate::types::*;

/// A typed write waiting in the debounce queue.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    SetOverlay { zone: ZoneId, overlay: ZoneOverlay },
    ResumeSchedule { zone: ZoneId },
    SetPresence(Presence),
    SetChildLock { serial: String, enabled: bool },
    SetOffset { serial: String, offset: f64 },
    SetAwayTemp { zone: ZoneId, temperature: f64 },
    SetDazzle { zone: ZoneId, enabled: bool },
    SetEarlyStart { zone: ZoneId, enabled: bool },
    SetOpenWindow { zone: ZoneId, enabled: bool },
    Identify { serial: String },
    ManualPoll(RefreshScope),
}

impl CommandKind {
    /// Default merge key. Overlay and resume on the same zone share a key so
    /// the later one replaces the earlier.
    pub fn resource_key(&self) -> ResourceKey {
        match self {
            CommandKind::SetOverlay { zone, .. } | CommandKind::ResumeSchedule { zone } => {
                ResourceKey::Zone(*zone)
            }
            CommandKind::SetPresence(_) => ResourceKey::Presence,
            CommandKind::SetChildLock { serial, .. } => ResourceKey::ChildLock(serial.clone()),
            CommandKind::SetOffset { serial, .. } => ResourceKey::Offset(serial.clone()),
            CommandKind::SetAwayTemp { zone, .. } => ResourceKey::AwayTemp(*zone),
            CommandKind::SetDazzle { zone, .. } => ResourceKey::Dazzle(*zone),
            CommandKind::SetEarlyStart { zone, .. } => ResourceKey::EarlyStart(*zone),
            CommandKind::SetOpenWindow { zone, .. } => ResourceKey::OpenWindow(*zone),
            CommandKind::Identify { serial } => ResourceKey::Identify(serial.clone()),
            CommandKind::ManualPoll(scope) => ResourceKey::ManualPoll(*scope),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::SetOverlay { .. } => "set_overlay",
            CommandKind::ResumeSchedule { .. } => "resume_schedule",
            CommandKind::SetPresence(_) => "set_presence",
            CommandKind::SetChildLock { .. } => "set_child_lock",
            CommandKind::SetOffset { .. } => "set_offset",
            CommandKind::SetAwayTemp { .. } => "set_away_temp",
            CommandKind::SetDazzle { .. } => "set_dazzle",
            CommandKind::SetEarlyStart { .. } => "set_early_start",
            CommandKind::SetOpenWindow { .. } => "set_open_window",
            CommandKind::Identify { .. } => "identify",
            CommandKind::ManualPoll(_) => "manual_poll",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: Uuid,
    pub key: ResourceKey,
    pub kind: CommandKind,
    /// Cached state from before the write was applied locally.
    pub rollback: Option<Rollback>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self::with_key(kind.resource_key(), kind)
    }

    pub fn with_key(key: ResourceKey, kind: CommandKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            kind,
            rollback: None,
        }
    }

    pub fn rollback(mut self, rollback: Rollback) -> Self {
        self.rollback = Some(rollback);
        self
    }
}
