use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

use crate::diff::diff_json;

/// How confirmed fetches are recorded in the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Whole snapshot on every fetch.
    Full,
    /// First snapshot in full, then only leaf changes.
    Diffed,
}

/// Append-only newline-delimited JSON record of outbound writes and
/// confirmed fetches.
pub(crate) struct CallJournal {
    mode: JournalMode,
    file: File,
    previous_snapshot: Option<Value>,
}

impl CallJournal {
    pub fn open(mode: JournalMode, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            previous_snapshot: None,
        })
    }

    pub fn log_call(&mut self, action: &str, target: Option<&str>, body: &Value, ok: bool) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "cmd",
            "action": action,
            "target": target,
            "body": body,
            "ok": ok,
        });
        self.write_line(&entry);
    }

    pub fn log_fetch(&mut self, snapshot: &Value) {
        let entry = match (self.mode, self.previous_snapshot.as_ref()) {
            (JournalMode::Diffed, Some(prev)) => {
                let mut changes = Vec::new();
                diff_json(prev, snapshot, "", &mut changes);
                let changes: Vec<Value> = changes
                    .into_iter()
                    .map(|c| json!({ "path": c.path, "old": c.old, "new": c.new }))
                    .collect();
                json!({
                    "ts": Utc::now().to_rfc3339(),
                    "dir": "fetch",
                    "changes": changes,
                })
            }
            (JournalMode::Diffed, None) => json!({
                "ts": Utc::now().to_rfc3339(),
                "dir": "fetch",
                "full": true,
                "body": snapshot,
            }),
            (JournalMode::Full, _) => json!({
                "ts": Utc::now().to_rfc3339(),
                "dir": "fetch",
                "body": snapshot,
            }),
        };
        self.write_line(&entry);
        if self.mode == JournalMode::Diffed {
            self.previous_snapshot = Some(snapshot.clone());
        }
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write journal entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn call_entries_are_ndjson() {
        let tmp = NamedTempFile::new().unwrap();
        let mut journal = CallJournal::open(JournalMode::Full, tmp.path()).unwrap();
        journal.log_call("set_presence", None, &json!({"homePresence": "AWAY"}), true);
        journal.log_call("identify_device", Some("RU01"), &Value::Null, false);

        let lines = read_lines(tmp.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["dir"], "cmd");
        assert_eq!(lines[0]["action"], "set_presence");
        assert!(lines[0]["ts"].as_str().is_some());
        assert_eq!(lines[1]["target"], "RU01");
        assert_eq!(lines[1]["ok"], false);
    }

    #[test]
    fn diffed_mode_writes_full_then_changes() {
        let tmp = NamedTempFile::new().unwrap();
        let mut journal = CallJournal::open(JournalMode::Diffed, tmp.path()).unwrap();
        journal.log_fetch(&json!({"zones": {"1": {"temp": 20.5}}}));
        journal.log_fetch(&json!({"zones": {"1": {"temp": 21.0}}}));
        journal.log_fetch(&json!({"zones": {"1": {"temp": 21.0}}}));

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["full"], true);
        assert!(lines[0]["body"].is_object());
        let changes = lines[1]["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["path"], "zones.1.temp");
        assert!(lines[2]["changes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn full_mode_always_writes_body() {
        let tmp = NamedTempFile::new().unwrap();
        let mut journal = CallJournal::open(JournalMode::Full, tmp.path()).unwrap();
        journal.log_fetch(&json!({"a": 1}));
        journal.log_fetch(&json!({"a": 1}));

        let lines = read_lines(tmp.path());
        assert_eq!(lines[1]["body"]["a"], 1);
        assert!(lines[1].get("changes").is_none());
    }
}
