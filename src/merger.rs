use std::collections::{BTreeMap, BTreeSet};

use crate::command::{Command, CommandKind};
use crate::state::Rollback;
use crate::types::*;

/// A batch of commands reduced to the minimal set of remote actions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedActions {
    pub presence: Option<Presence>,
    pub child_locks: BTreeMap<String, bool>,
    pub offsets: BTreeMap<String, f64>,
    pub away_temps: BTreeMap<ZoneId, f64>,
    pub dazzle: BTreeMap<ZoneId, bool>,
    pub early_start: BTreeMap<ZoneId, bool>,
    pub open_window: BTreeMap<ZoneId, bool>,
    pub identify: BTreeSet<String>,
    /// `None` resumes the zone schedule.
    pub zones: BTreeMap<ZoneId, Option<ZoneOverlay>>,
    /// Collapses to `{All}` whenever `All` was requested.
    pub manual_poll: BTreeSet<RefreshScope>,
    /// Oldest rollback context per key in the batch.
    pub rollbacks: BTreeMap<ResourceKey, Rollback>,
    pub command_count: usize,
}

impl MergedActions {
    /// Zones to resume and zones to overlay, each sent as one bulk call.
    pub fn zone_calls(&self) -> (Vec<ZoneId>, Vec<(ZoneId, ZoneOverlay)>) {
        let mut resumes = Vec::new();
        let mut overlays = Vec::new();
        for (zone, action) in &self.zones {
            match action {
                None => resumes.push(*zone),
                Some(o) => overlays.push((*zone, *o)),
            }
        }
        (resumes, overlays)
    }

    pub fn has_manual_poll(&self) -> bool {
        !self.manual_poll.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.command_count == 0
    }
}

/// Later commands override earlier ones for the same resource.
pub fn merge(commands: &[Command]) -> MergedActions {
    let mut merged = MergedActions {
        command_count: commands.len(),
        ..MergedActions::default()
    };

    for cmd in commands {
        if let Some(rb) = &cmd.rollback {
            merged
                .rollbacks
                .entry(cmd.key.clone())
                .or_insert_with(|| rb.clone());
        }

        match &cmd.kind {
            CommandKind::SetOverlay { zone, overlay } => {
                merged.zones.insert(*zone, Some(*overlay));
            }
            CommandKind::ResumeSchedule { zone } => {
                merged.zones.insert(*zone, None);
            }
            CommandKind::SetPresence(p) => merged.presence = Some(*p),
            CommandKind::SetChildLock { serial, enabled } => {
                merged.child_locks.insert(serial.clone(), *enabled);
            }
            CommandKind::SetOffset { serial, offset } => {
                merged.offsets.insert(serial.clone(), *offset);
            }
            CommandKind::SetAwayTemp { zone, temperature } => {
                merged.away_temps.insert(*zone, *temperature);
            }
            CommandKind::SetDazzle { zone, enabled } => {
                merged.dazzle.insert(*zone, *enabled);
            }
            CommandKind::SetEarlyStart { zone, enabled } => {
                merged.early_start.insert(*zone, *enabled);
            }
            CommandKind::SetOpenWindow { zone, enabled } => {
                merged.open_window.insert(*zone, *enabled);
            }
            CommandKind::Identify { serial } => {
                merged.identify.insert(serial.clone());
            }
            CommandKind::ManualPoll(scope) => {
                merged.manual_poll.insert(*scope);
            }
        }
    }

    if merged.manual_poll.contains(&RefreshScope::All) {
        merged.manual_poll = BTreeSet::from([RefreshScope::All]);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(temp: f64) -> ZoneOverlay {
        ZoneOverlay {
            setting: OverlaySetting {
                zone_type: ZoneType::Heating,
                power: Power::On,
                temperature: Some(temp),
            },
            termination: Termination::Manual,
        }
    }

    #[test]
    fn later_resume_wins_over_overlay() {
        let a = overlay(21.0);
        let b = overlay(19.0);
        let merged = merge(&[
            Command::new(CommandKind::SetOverlay { zone: 1, overlay: a }),
            Command::new(CommandKind::ResumeSchedule { zone: 1 }),
            Command::new(CommandKind::SetOverlay { zone: 2, overlay: b }),
        ]);
        assert_eq!(merged.zones, BTreeMap::from([(1, None), (2, Some(b))]));
        let (resumes, overlays) = merged.zone_calls();
        assert_eq!(resumes, vec![1]);
        assert_eq!(overlays, vec![(2, b)]);
    }

    #[test]
    fn later_overlay_wins_over_resume() {
        let a = overlay(23.0);
        let merged = merge(&[
            Command::new(CommandKind::ResumeSchedule { zone: 4 }),
            Command::new(CommandKind::SetOverlay { zone: 4, overlay: a }),
        ]);
        assert_eq!(merged.zones[&4], Some(a));
    }

    #[test]
    fn per_device_last_write_wins() {
        let merged = merge(&[
            Command::new(CommandKind::SetChildLock {
                serial: "VA1".into(),
                enabled: true,
            }),
            Command::new(CommandKind::SetOffset {
                serial: "VA1".into(),
                offset: 0.5,
            }),
            Command::new(CommandKind::SetChildLock {
                serial: "VA1".into(),
                enabled: false,
            }),
            Command::new(CommandKind::SetOffset {
                serial: "VA2".into(),
                offset: -1.0,
            }),
            Command::new(CommandKind::SetPresence(Presence::Away)),
            Command::new(CommandKind::SetPresence(Presence::Home)),
        ]);
        assert_eq!(merged.child_locks, BTreeMap::from([("VA1".to_string(), false)]));
        assert_eq!(merged.offsets.len(), 2);
        assert_eq!(merged.presence, Some(Presence::Home));
        assert_eq!(merged.command_count, 6);
    }

    #[test]
    fn identify_is_deduplicated() {
        let merged = merge(&[
            Command::new(CommandKind::Identify { serial: "RU1".into() }),
            Command::new(CommandKind::Identify { serial: "RU1".into() }),
            Command::new(CommandKind::Identify { serial: "RU2".into() }),
        ]);
        assert_eq!(merged.identify.len(), 2);
    }

    #[test]
    fn manual_poll_all_dominates() {
        let merged = merge(&[
            Command::new(CommandKind::ManualPoll(RefreshScope::Offsets)),
            Command::new(CommandKind::ManualPoll(RefreshScope::All)),
            Command::new(CommandKind::ManualPoll(RefreshScope::Away)),
        ]);
        assert_eq!(merged.manual_poll, BTreeSet::from([RefreshScope::All]));

        let merged = merge(&[
            Command::new(CommandKind::ManualPoll(RefreshScope::Offsets)),
            Command::new(CommandKind::ManualPoll(RefreshScope::Away)),
        ]);
        assert_eq!(merged.manual_poll.len(), 2);
    }

    #[test]
    fn earliest_rollback_is_kept() {
        let first = Rollback::Offset {
            serial: "VA1".into(),
            prior: Some(0.0),
        };
        let second = Rollback::Offset {
            serial: "VA1".into(),
            prior: Some(1.0),
        };
        let merged = merge(&[
            Command::new(CommandKind::SetOffset {
                serial: "VA1".into(),
                offset: 1.0,
            })
            .rollback(first.clone()),
            Command::new(CommandKind::SetOffset {
                serial: "VA1".into(),
                offset: 2.0,
            })
            .rollback(second),
        ]);
        assert_eq!(merged.rollbacks[&ResourceKey::Offset("VA1".into())], first);
        assert_eq!(merged.offsets["VA1"], 2.0);
    }

    #[test]
    fn empty_batch() {
        let merged = merge(&[]);
        assert!(merged.is_empty());
        assert_eq!(merged.zone_calls(), (vec![], vec![]));
    }
}
