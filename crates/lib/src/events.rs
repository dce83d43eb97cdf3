//! Append-only audit log of gateway events (JSON lines).
//!
//! Each line is `{"timestamp": ..., "eventType": ..., ...details}`. Write failures are logged
//! at debug level and otherwise ignored; the event log never affects message handling.

use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// File name of the event log inside the work directory.
pub const EVENT_LOG_FILE: &str = "events.jsonl";

/// Handle to the event log. Cloning is cheap; a disabled log drops every event.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    path: Option<PathBuf>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Event log at `<work_dir>/events.jsonl`.
    pub fn in_work_dir(work_dir: &Path) -> Self {
        Self::new(work_dir.join(EVENT_LOG_FILE))
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event. `details` should be a JSON object; other values are stored under "details".
    pub async fn record(&self, event_type: &str, details: Value) {
        let Some(ref path) = self.path else { return };
        let line = event_line(event_type, details);
        if let Err(e) = append_line(path, &line).await {
            log::debug!("event log write to {} failed: {}", path.display(), e);
        }
    }
}

fn event_line(event_type: &str, details: Value) -> String {
    let mut obj = Map::new();
    obj.insert("timestamp".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    obj.insert("eventType".to_string(), json!(event_type));
    match details {
        Value::Object(map) => obj.extend(map),
        Value::Null => {}
        other => {
            obj.insert("details".to_string(), other);
        }
    }
    Value::Object(obj).to_string()
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = std::env::temp_dir().join(format!("caduceus-events-{}", uuid::Uuid::new_v4()));
        let log = EventLog::in_work_dir(&dir);
        log.record("gateway_started", json!({ "channels": ["web"] })).await;
        log.record("gateway_stopped", Value::Null).await;

        let text = tokio::fs::read_to_string(dir.join(EVENT_LOG_FILE)).await.expect("read log");
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["eventType"], "gateway_started");
        assert_eq!(lines[0]["channels"][0], "web");
        assert_eq!(lines[1]["eventType"], "gateway_stopped");
        assert!(lines[1]["timestamp"].is_string());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn disabled_log_is_a_no_op() {
        let log = EventLog::disabled();
        log.record("anything", json!({})).await;
        assert!(log.path().is_none());
    }
}
