use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskStatus;

/// One append-only record describing a single ledger transition.
///
/// Entries for a task are totally ordered by insertion (`id` ascending),
/// which also orders them by `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub task_id: String,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub ts: DateTime<Utc>,
    pub attempt: i64,
    pub message: Option<String>,
}
