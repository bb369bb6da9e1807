use std::sync::Mutex;

use serde_json::{Value, json};
use tracing::{debug, error};

use crate::journal::CallJournal;
use crate::merger::MergedActions;
use crate::protocol::{
    away_configuration_body, bulk_overlay_body, child_lock_body, enabled_body, offset_body,
    presence_lock_body,
};
use crate::remote::TadoApi;
use crate::types::ResourceKey;
use crate::Result;

/// Outcome of sending one merged batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct DispatchReport {
    /// Outbound write calls attempted.
    pub calls: usize,
    /// Keys whose remote write failed.
    pub failed: Vec<ResourceKey>,
}

struct Dispatcher<'a> {
    journal: Option<&'a Mutex<CallJournal>>,
    report: DispatchReport,
}

impl Dispatcher<'_> {
    fn record(
        &mut self,
        action: &str,
        target: Option<String>,
        body: Value,
        result: Result<()>,
        keys: Vec<ResourceKey>,
    ) {
        self.report.calls += 1;
        let ok = result.is_ok();
        if let Err(e) = result {
            let target = target.as_deref().unwrap_or("");
            error!(action, target, error = %e, "remote write failed");
            self.report.failed.extend(keys);
        }
        if let Some(journal) = self.journal {
            journal
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .log_call(action, target.as_deref(), &body, ok);
        }
    }
}

/// Sends every action in `merged`. Global and per-device actions go first,
/// zone overlays last as at most two bulk calls. A failed call is logged
/// and does not stop the rest of the batch.
pub(crate) async fn dispatch(
    api: &dyn TadoApi,
    merged: &MergedActions,
    journal: Option<&Mutex<CallJournal>>,
) -> DispatchReport {
    let mut d = Dispatcher {
        journal,
        report: DispatchReport::default(),
    };

    if let Some(presence) = merged.presence {
        debug!(presence = presence.as_tado_str(), "setting presence");
        let result = api.set_presence(presence).await;
        d.record(
            "set_presence",
            None,
            presence_lock_body(presence),
            result,
            vec![ResourceKey::Presence],
        );
    }

    for (serial, enabled) in &merged.child_locks {
        let result = api.set_child_lock(serial, *enabled).await;
        d.record(
            "set_child_lock",
            Some(serial.clone()),
            child_lock_body(*enabled),
            result,
            vec![ResourceKey::ChildLock(serial.clone())],
        );
    }

    for (serial, offset) in &merged.offsets {
        let result = api.set_temperature_offset(serial, *offset).await;
        d.record(
            "set_temperature_offset",
            Some(serial.clone()),
            offset_body(*offset),
            result,
            vec![ResourceKey::Offset(serial.clone())],
        );
    }

    for (zone, temperature) in &merged.away_temps {
        let result = api.set_away_configuration(*zone, *temperature).await;
        d.record(
            "set_away_configuration",
            Some(zone.to_string()),
            away_configuration_body(*temperature),
            result,
            vec![ResourceKey::AwayTemp(*zone)],
        );
    }

    for (zone, enabled) in &merged.dazzle {
        let result = api.set_dazzle_mode(*zone, *enabled).await;
        d.record(
            "set_dazzle_mode",
            Some(zone.to_string()),
            enabled_body(*enabled),
            result,
            vec![ResourceKey::Dazzle(*zone)],
        );
    }

    for (zone, enabled) in &merged.early_start {
        let result = api.set_early_start(*zone, *enabled).await;
        d.record(
            "set_early_start",
            Some(zone.to_string()),
            enabled_body(*enabled),
            result,
            vec![ResourceKey::EarlyStart(*zone)],
        );
    }

    for (zone, enabled) in &merged.open_window {
        let result = api.set_open_window_detection(*zone, *enabled).await;
        d.record(
            "set_open_window_detection",
            Some(zone.to_string()),
            enabled_body(*enabled),
            result,
            vec![ResourceKey::OpenWindow(*zone)],
        );
    }

    for serial in &merged.identify {
        let result = api.identify_device(serial).await;
        d.record(
            "identify_device",
            Some(serial.clone()),
            Value::Null,
            result,
            vec![ResourceKey::Identify(serial.clone())],
        );
    }

    let (resumes, overlays) = merged.zone_calls();
    if !resumes.is_empty() {
        debug!(zones = ?resumes, "bulk resuming zones");
        let result = api.reset_all_zones_overlay(&resumes).await;
        d.record(
            "reset_all_zones_overlay",
            None,
            json!({ "rooms": resumes }),
            result,
            resumes.iter().map(|z| ResourceKey::Zone(*z)).collect(),
        );
    }
    if !overlays.is_empty() {
        debug!(count = overlays.len(), "bulk setting overlays");
        let result = api.set_all_zones_overlay(&overlays).await;
        d.record(
            "set_all_zones_overlay",
            None,
            bulk_overlay_body(&overlays),
            result,
            overlays.iter().map(|(z, _)| ResourceKey::Zone(*z)).collect(),
        );
    }

    d.report
}
