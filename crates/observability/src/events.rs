use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use yggdrasil_errors::{DispatchError, DispatchResult};

/// Structured event names emitted by the dispatcher.
pub mod event {
    pub const TASK_STARTED: &str = "task_started";
    pub const TASK_RETRY_SCHEDULED: &str = "task_retry_scheduled";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const TASK_FAILED: &str = "task_failed";
    pub const TASK_FAILED_MAX_RETRIES: &str = "task_failed_max_retries";
    pub const HOST_UNHEALTHY: &str = "host_unhealthy";
    pub const BREAKER_OPENED: &str = "breaker_opened";
    pub const BREAKER_CLOSED: &str = "breaker_closed";
    pub const SHUTDOWN_BEGIN: &str = "shutdown_begin";
    pub const SHUTDOWN_END: &str = "shutdown_end";
}

/// One structured event. Serialized as a single JSON line:
/// `{timestamp, task_id, event, level, ...fields}`.
#[derive(Debug, Clone)]
pub struct Event {
    name: &'static str,
    level: &'static str,
    task_id: Option<String>,
    fields: Map<String, Value>,
}

impl Event {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            level: "info",
            task_id: None,
            fields: Map::new(),
        }
    }

    pub fn warning(mut self) -> Self {
        self.level = "warning";
        self
    }

    pub fn error(mut self) -> Self {
        self.level = "error";
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    fn to_json_line(&self) -> String {
        let mut object = Map::new();
        object.insert(
            "timestamp".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        if let Some(task_id) = &self.task_id {
            object.insert("task_id".into(), Value::String(task_id.clone()));
        }
        object.insert("event".into(), Value::String(self.name.to_string()));
        object.insert("level".into(), Value::String(self.level.to_string()));
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object).to_string()
    }
}

/// Append-only JSONL event stream. A disabled log swallows events so
/// callers never branch on whether observability is wired up.
pub struct EventLog {
    file: Option<Mutex<tokio::fs::File>>,
}

impl EventLog {
    pub async fn open(log_dir: impl AsRef<Path>) -> DispatchResult<Self> {
        let log_dir = log_dir.as_ref();
        tokio::fs::create_dir_all(log_dir)
            .await
            .map_err(|e| DispatchError::internal(format!("create {}: {e}", log_dir.display())))?;

        let path = log_dir.join("dispatcher.jsonl");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| DispatchError::internal(format!("open {}: {e}", path.display())))?;

        Ok(Self {
            file: Some(Mutex::new(file)),
        })
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    /// Write failures are logged and swallowed: losing one event line must
    /// not fail the task that produced it.
    pub async fn emit(&self, event: Event) {
        let Some(file) = &self.file else {
            return;
        };
        let mut line = event.to_json_line();
        line.push('\n');

        let mut file = file.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(error = %e, "failed to append event log entry");
        }
    }
}
