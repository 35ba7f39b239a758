//! Line-delimited JSON interchange. The JSONL form exists only for humans
//! and migration; the SQLite file is the source of truth.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use yggdrasil_domain::Task;
use yggdrasil_errors::{DispatchError, DispatchResult};

use crate::store::Ledger;

impl Ledger {
    /// Write every task as one JSON object per line. The file is written
    /// to a temp sibling and renamed so readers never see a partial
    /// snapshot.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> DispatchResult<usize> {
        let path = path.as_ref();
        let tasks = self.all_tasks().await?;

        let tmp_path = path.with_extension("jsonl.tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| DispatchError::internal(format!("create {}: {e}", tmp_path.display())))?;

        for task in &tasks {
            let mut line = serde_json::to_string(task)?;
            line.push('\n');
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| DispatchError::internal(format!("write export: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| DispatchError::internal(format!("flush export: {e}")))?;
        drop(file);

        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| DispatchError::internal(format!("rename export: {e}")))?;

        debug!(count = tasks.len(), path = %path.display(), "exported ledger");
        Ok(tasks.len())
    }

    /// Populate from a JSONL snapshot. Malformed lines and duplicate ids
    /// are skipped with a warning; returns the number of imported records.
    pub async fn import_jsonl(&self, path: impl AsRef<Path>) -> DispatchResult<usize> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DispatchError::internal(format!("read {}: {e}", path.display())))?;

        let mut imported = 0usize;
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let task: Task = match serde_json::from_str(line) {
                Ok(task) => task,
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "skipping malformed import line");
                    continue;
                }
            };
            match self.create(&task).await {
                Ok(()) => imported += 1,
                Err(DispatchError::Conflict(_)) => {
                    warn!(task_id = %task.id, "skipping duplicate task on import");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(imported, path = %path.display(), "imported ledger snapshot");
        Ok(imported)
    }
}
