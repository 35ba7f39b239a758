use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use yggdrasil_domain::{AuditEntry, Task, TaskStatus};
use yggdrasil_errors::{DispatchError, DispatchResult};

use crate::mapping::{
    row_to_audit, row_to_task, status_from_db, truncate_utf8, ts_to_db,
};

/// Upper bound for the `result` and `error` columns. Anything longer is
/// kept only in the sidecar error log.
pub const MAX_FIELD_BYTES: usize = 32 * 1024;

const TASK_COLUMNS: &str = "id, title, description, params, task_type, labels, dependencies, \
     priority, status, created_at, updated_at, closed_at, attempt_count, result, error";

/// Fields written alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub result: Option<String>,
    pub error: Option<String>,
    pub attempt: Option<i64>,
    pub message: Option<String>,
}

impl TaskUpdate {
    pub fn with_result(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            ..Default::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn attempt(mut self, attempt: i64) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (or create) the single-file store with WAL journaling and run
    /// migrations. WAL permits concurrent readers against the one writer.
    pub async fn open(path: impl AsRef<Path>) -> DispatchResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        debug!(path = %path.as_ref().display(), "opened ledger");
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> DispatchResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                params TEXT,
                task_type TEXT NOT NULL DEFAULT '',
                labels TEXT NOT NULL DEFAULT '[]',
                dependencies TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 2,
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                old_status TEXT NOT NULL,
                new_status TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                message TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(priority, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_audit_task_id ON audit_log(task_id)",
        ] {
            sqlx::query(index_sql).execute(pool).await?;
        }

        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn create(&self, task: &Task) -> DispatchResult<()> {
        let params = match &task.params {
            serde_json::Value::Null => None,
            value => Some(serde_json::to_string(value)?),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, title, description, params, task_type, labels, dependencies,
                               priority, status, created_at, updated_at, closed_at, attempt_count,
                               result, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(params)
        .bind(&task.task_type)
        .bind(serde_json::to_string(&task.labels)?)
        .bind(serde_json::to_string(&task.dependencies)?)
        .bind(task.priority)
        .bind(task.status.as_str())
        .bind(ts_to_db(task.created_at))
        .bind(ts_to_db(task.updated_at))
        .bind(task.closed_at.map(ts_to_db))
        .bind(task.attempt_count)
        .bind(&task.result)
        .bind(&task.error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(DispatchError::Conflict(format!(
                "task {} already exists",
                task.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, task_id: &str) -> DispatchResult<Task> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_task(&row),
            None => Err(DispatchError::task_not_found(task_id)),
        }
    }

    /// Open tasks whose dependencies are all closed, ordered by
    /// `(priority ASC, created_at ASC)`. Both queries run inside one
    /// transaction so the result is a consistent snapshot.
    pub async fn ready_tasks(&self) -> DispatchResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'open' \
             ORDER BY priority ASC, created_at ASC"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let open_tasks: Vec<Task> = rows
            .iter()
            .map(row_to_task)
            .collect::<DispatchResult<_>>()?;

        let mut dep_ids: Vec<&str> = open_tasks
            .iter()
            .flat_map(|t| t.dependencies.iter().map(String::as_str))
            .collect();
        dep_ids.sort_unstable();
        dep_ids.dedup();

        let mut dep_status: HashMap<String, TaskStatus> = HashMap::new();
        if !dep_ids.is_empty() {
            let placeholders: Vec<String> = (1..=dep_ids.len()).map(|i| format!("${i}")).collect();
            let sql = format!(
                "SELECT id, status FROM tasks WHERE id IN ({})",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql);
            for id in &dep_ids {
                query = query.bind(*id);
            }
            for row in query.fetch_all(&mut *tx).await? {
                let id: String = sqlx::Row::try_get(&row, "id")?;
                let status: String = sqlx::Row::try_get(&row, "status")?;
                dep_status.insert(id, status_from_db(&status)?);
            }
        }

        tx.commit().await?;

        // A missing dependency id can never be satisfied, so the task
        // stays out of the ready queue rather than failing the query.
        Ok(open_tasks
            .into_iter()
            .filter(|task| {
                task.dependencies
                    .iter()
                    .all(|dep| dep_status.get(dep) == Some(&TaskStatus::Closed))
            })
            .collect())
    }

    /// Atomic status transition: validates against the permitted-transition
    /// table, writes all fields, and appends one audit row inside a single
    /// immediate-write transaction.
    #[instrument(skip(self, update), fields(task_id = %task_id, new_status = %new_status))]
    pub async fn update(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        update: TaskUpdate,
    ) -> DispatchResult<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let outcome = Self::apply_update(&mut conn, task_id, new_status, &update).await;
        match outcome {
            Ok(old_status) => {
                if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(e.into());
                }
                debug!(task_id, from = %old_status, to = %new_status, "ledger transition");
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn apply_update(
        conn: &mut SqliteConnection,
        task_id: &str,
        new_status: TaskStatus,
        update: &TaskUpdate,
    ) -> DispatchResult<TaskStatus> {
        let row = sqlx::query("SELECT status, attempt_count FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&mut *conn)
            .await?;

        let row = row.ok_or_else(|| DispatchError::task_not_found(task_id))?;
        let old_status_raw: String = sqlx::Row::try_get(&row, "status")?;
        let current_attempt: i64 = sqlx::Row::try_get(&row, "attempt_count")?;
        let old_status = status_from_db(&old_status_raw)?;

        if !old_status.can_transition_to(new_status) {
            return Err(DispatchError::InvalidTransition {
                task_id: task_id.to_string(),
                from: old_status,
                to: new_status,
            });
        }

        let attempt = match update.attempt {
            Some(attempt) if attempt < current_attempt => {
                return Err(DispatchError::Conflict(format!(
                    "attempt_count may not decrease ({current_attempt} -> {attempt})"
                )));
            }
            Some(attempt) => attempt,
            None => current_attempt,
        };

        let now = ts_to_db(Utc::now());
        let result = update
            .result
            .as_deref()
            .map(|s| truncate_utf8(s, MAX_FIELD_BYTES).to_string());
        let error = update
            .error
            .as_deref()
            .map(|s| truncate_utf8(s, MAX_FIELD_BYTES).to_string());

        let mut sets = vec!["status = ?", "updated_at = ?", "attempt_count = ?"];
        if result.is_some() {
            sets.push("result = ?");
        }
        if error.is_some() {
            sets.push("error = ?");
        }
        if new_status == TaskStatus::Closed {
            sets.push("closed_at = ?");
        }
        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));

        let mut query = sqlx::query(&sql)
            .bind(new_status.as_str())
            .bind(&now)
            .bind(attempt);
        if let Some(result) = &result {
            query = query.bind(result);
        }
        if let Some(error) = &error {
            query = query.bind(error);
        }
        if new_status == TaskStatus::Closed {
            query = query.bind(&now);
        }
        query.bind(task_id).execute(&mut *conn).await?;

        sqlx::query(
            "INSERT INTO audit_log (task_id, ts, old_status, new_status, attempt, message) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(task_id)
        .bind(&now)
        .bind(old_status.as_str())
        .bind(new_status.as_str())
        .bind(attempt)
        .bind(&update.message)
        .execute(&mut *conn)
        .await?;

        Ok(old_status)
    }

    pub async fn stats(&self) -> DispatchResult<HashMap<TaskStatus, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats: HashMap<TaskStatus, i64> =
            TaskStatus::all().into_iter().map(|s| (s, 0)).collect();
        for row in rows {
            let status: String = sqlx::Row::try_get(&row, "status")?;
            let count: i64 = sqlx::Row::try_get(&row, "n")?;
            stats.insert(status_from_db(&status)?, count);
        }
        Ok(stats)
    }

    /// Audit entries for one task in insertion order (oldest first).
    pub async fn audit(&self, task_id: &str) -> DispatchResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, task_id, ts, old_status, new_status, attempt, message \
             FROM audit_log WHERE task_id = $1 ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_audit).collect()
    }

    pub async fn all_tasks(&self) -> DispatchResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
