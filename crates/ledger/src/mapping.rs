use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use yggdrasil_domain::{AuditEntry, Task, TaskStatus};
use yggdrasil_errors::{DispatchError, DispatchResult};

/// Timestamps are stored as RFC 3339 UTC with fixed-width microseconds so
/// lexicographic order in SQL matches chronological order.
pub(crate) fn ts_to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_db(raw: &str) -> DispatchResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DispatchError::Serialization(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn status_from_db(raw: &str) -> DispatchResult<TaskStatus> {
    TaskStatus::parse(raw)
        .ok_or_else(|| DispatchError::Serialization(format!("unknown status {raw:?}")))
}

fn string_list_from_db(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub(crate) fn row_to_task(row: &SqliteRow) -> DispatchResult<Task> {
    let status: String = row.try_get("status")?;
    let labels: String = row.try_get("labels")?;
    let dependencies: String = row.try_get("dependencies")?;
    let params: Option<String> = row.try_get("params")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let closed_at: Option<String> = row.try_get("closed_at")?;

    Ok(Task {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        params: params
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .unwrap_or_default()
            .unwrap_or(serde_json::Value::Null),
        task_type: row.try_get("task_type")?,
        labels: string_list_from_db(&labels),
        dependencies: string_list_from_db(&dependencies),
        priority: row.try_get("priority")?,
        status: status_from_db(&status)?,
        created_at: ts_from_db(&created_at)?,
        updated_at: ts_from_db(&updated_at)?,
        closed_at: closed_at.as_deref().map(ts_from_db).transpose()?,
        attempt_count: row.try_get("attempt_count")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
    })
}

pub(crate) fn row_to_audit(row: &SqliteRow) -> DispatchResult<AuditEntry> {
    let old_status: String = row.try_get("old_status")?;
    let new_status: String = row.try_get("new_status")?;
    let ts: String = row.try_get("ts")?;

    Ok(AuditEntry {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        old_status: status_from_db(&old_status)?,
        new_status: status_from_db(&new_status)?,
        ts: ts_from_db(&ts)?,
        attempt: row.try_get("attempt")?,
        message: row.try_get("message")?,
    })
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
pub(crate) fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_and_sort_lexically() {
        // Microsecond-resolution instants survive the round trip exactly.
        let earlier = DateTime::from_timestamp_micros(1_700_000_000_123_456)
            .unwrap()
            .with_timezone(&Utc);
        let later = earlier + chrono::Duration::microseconds(1);

        let a = ts_to_db(earlier);
        let b = ts_to_db(later);
        assert!(a < b);
        assert_eq!(ts_from_db(&a).unwrap(), earlier);
        assert_eq!(ts_from_db(&b).unwrap(), later);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "ab\u{00e9}cd";
        // The e-acute occupies bytes 2..4; cutting at 3 must back off to 2.
        assert_eq!(truncate_utf8(s, 3), "ab");
        assert_eq!(truncate_utf8(s, 4), "ab\u{00e9}");
        assert_eq!(truncate_utf8(s, 100), s);
    }
}
