use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use yggdrasil_errors::{DispatchError, DispatchResult};

/// Cap for the report embedded into the ledger `error` field. The sidecar
/// log keeps the full record.
const MAX_REPORT_BYTES: usize = 32 * 1024;

/// Execution context captured alongside a failure.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub task_type: String,
    pub host: String,
    pub attempt: i64,
    /// Last bytes of handler output, when any was produced before failing.
    pub output_tail: Option<String>,
}

/// Persists failure records to a sidecar JSONL file and renders the
/// bounded plain-text report stored in the ledger.
pub struct ErrorTracker {
    path: Option<PathBuf>,
}

impl ErrorTracker {
    pub async fn open(log_dir: impl AsRef<Path>) -> DispatchResult<Self> {
        let log_dir = log_dir.as_ref();
        tokio::fs::create_dir_all(log_dir)
            .await
            .map_err(|e| DispatchError::internal(format!("create {}: {e}", log_dir.display())))?;
        Ok(Self {
            path: Some(log_dir.join("errors.jsonl")),
        })
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Record a failure and return the report destined for the ledger
    /// `error` field (at most 32 KB).
    pub async fn track(
        &self,
        task_id: &str,
        error: &DispatchError,
        context: &ErrorContext,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let record = json!({
            "task_id": task_id,
            "timestamp": timestamp,
            "error_kind": error.kind(),
            "error_message": error.to_string(),
            "context": {
                "task_type": context.task_type,
                "host": context.host,
                "attempt": context.attempt,
                "output_tail": context.output_tail,
            },
        });

        if let Some(path) = &self.path {
            if let Err(e) = append_line(path, &record.to_string()).await {
                warn!(error = %e, "failed to append error log entry");
            }
        }

        let mut report = format!(
            "ERROR REPORT\n\
             ========================================\n\
             Task ID: {task_id}\n\
             Time: {timestamp}\n\
             Kind: {}\n\
             Message: {}\n\
             \n\
             Context:\n\
             task_type: {}\n\
             host: {}\n\
             attempt: {}\n",
            error.kind(),
            error,
            context.task_type,
            context.host,
            context.attempt,
        );
        if let Some(tail) = &context.output_tail {
            report.push_str("\nOutput tail:\n");
            report.push_str(tail);
            report.push('\n');
        }

        if report.len() > MAX_REPORT_BYTES {
            let mut end = MAX_REPORT_BYTES;
            while end > 0 && !report.is_char_boundary(end) {
                end -= 1;
            }
            report.truncate(end);
        }
        report
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_carries_kind_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ErrorTracker::open(dir.path()).await.unwrap();

        let error = DispatchError::Timeout("read timed out after 120s".into());
        let context = ErrorContext {
            task_type: "reasoning".into(),
            host: "surtr-reasoning".into(),
            attempt: 3,
            output_tail: Some("partial output".into()),
        };
        let report = tracker.track("t1", &error, &context).await;

        assert!(report.starts_with("ERROR REPORT"));
        assert!(report.contains("Kind: timeout"));
        assert!(report.contains("host: surtr-reasoning"));
        assert!(report.contains("attempt: 3"));
        assert!(report.contains("partial output"));

        let sidecar = std::fs::read_to_string(dir.path().join("errors.jsonl")).unwrap();
        let record: serde_json::Value = serde_json::from_str(sidecar.lines().next().unwrap()).unwrap();
        assert_eq!(record["task_id"], "t1");
        assert_eq!(record["error_kind"], "timeout");
        assert_eq!(record["context"]["attempt"], 3);
    }

    #[tokio::test]
    async fn report_is_capped_at_32k() {
        let tracker = ErrorTracker::disabled();
        let error = DispatchError::Internal("boom".into());
        let context = ErrorContext {
            output_tail: Some("y".repeat(64 * 1024)),
            ..Default::default()
        };
        let report = tracker.track("t1", &error, &context).await;
        assert!(report.len() <= MAX_REPORT_BYTES);
    }
}
