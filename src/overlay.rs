use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::types::{Power, Presence, ResourceKey};

/// Speculative value shown to readers until a fetch confirms it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimisticValue {
    Zone {
        overlay_active: bool,
        power: Option<Power>,
        temperature: Option<f64>,
    },
    Presence(Presence),
    Flag(bool),
    Temperature(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimisticEntry {
    pub value: OptimisticValue,
    pub created_at: DateTime<Utc>,
}

/// At most one entry per resource key; a new write replaces the previous one.
#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    entries: HashMap<ResourceKey, OptimisticEntry>,
}

impl OptimisticOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: ResourceKey, value: OptimisticValue, now: DateTime<Utc>) {
        self.entries.insert(
            key,
            OptimisticEntry {
                value,
                created_at: now,
            },
        );
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&OptimisticValue> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &ResourceKey) -> Option<&OptimisticEntry> {
        self.entries.get(key)
    }

    pub fn clear(&mut self, key: &ResourceKey) -> Option<OptimisticEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries that confirmed state now matches and entries older than
    /// `ttl`. Returns the number removed.
    pub fn cleanup<F>(&mut self, now: DateTime<Utc>, ttl: TimeDelta, is_confirmed: F) -> usize
    where
        F: Fn(&ResourceKey, &OptimisticValue) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            if now - entry.created_at >= ttl {
                debug!(key = %key, "optimistic entry expired");
                return false;
            }
            if is_confirmed(key, &entry.value) {
                debug!(key = %key, "optimistic entry confirmed");
                return false;
            }
            true
        });
        before - self.entries.len()
    }
}
