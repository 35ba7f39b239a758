use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task in the ledger.
///
/// `Closed` and `Cancelled` are terminal: once reached, a task never
/// returns to `Open` or `InProgress`. `Blocked` is terminal for the
/// dispatcher but may be reopened by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Closed => "closed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "open" => Some(TaskStatus::Open),
            "in_progress" => Some(TaskStatus::InProgress),
            "closed" => Some(TaskStatus::Closed),
            "blocked" => Some(TaskStatus::Blocked),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Closed | TaskStatus::Cancelled)
    }

    /// Permitted status transitions:
    ///
    /// ```text
    /// open        -> in_progress | cancelled
    /// in_progress -> closed | blocked | cancelled | open (requeue)
    /// blocked     -> open (operator)
    /// ```
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Open, InProgress)
                | (Open, Cancelled)
                | (InProgress, Closed)
                | (InProgress, Blocked)
                | (InProgress, Cancelled)
                | (InProgress, Open)
                | (Blocked, Open)
        )
    }

    pub fn all() -> [TaskStatus; 5] {
        [
            TaskStatus::Open,
            TaskStatus::InProgress,
            TaskStatus::Closed,
            TaskStatus::Blocked,
            TaskStatus::Cancelled,
        ]
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in the ledger.
///
/// Tasks are created externally (humans or planners) and moved through
/// status transitions solely by the dispatcher. They are never deleted;
/// history lives in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Opaque payload forwarded verbatim to executor endpoints.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub priority: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_count: i64,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            params: serde_json::Value::Null,
            task_type: String::new(),
            labels: Vec::new(),
            dependencies: Vec::new(),
            priority: 2,
            status: TaskStatus::Open,
            created_at: now,
            updated_at: now,
            closed_at: None,
            attempt_count: 0,
            result: None,
            error: None,
        }
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Effective type used for handler and route resolution. Falls back to
    /// a label naming a known task type when `type` is empty, matching how
    /// planner-created records arrive without an explicit type.
    pub fn effective_type(&self) -> &str {
        if !self.task_type.is_empty() {
            return &self.task_type;
        }
        const KNOWN: [&str; 5] = [
            "code-generation",
            "text-processing",
            "reasoning",
            "summarize",
            "general",
        ];
        for label in &self.labels {
            if KNOWN.contains(&label.as_str()) {
                return label;
            }
        }
        "general"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_admit_no_transitions() {
        for next in TaskStatus::all() {
            assert!(!TaskStatus::Closed.can_transition_to(next));
            assert!(!TaskStatus::Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn open_task_can_start_or_be_cancelled() {
        assert!(TaskStatus::Open.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Open.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Open.can_transition_to(TaskStatus::Closed));
        assert!(!TaskStatus::Open.can_transition_to(TaskStatus::Blocked));
    }

    #[test]
    fn in_progress_task_can_requeue() {
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Open));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Closed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Blocked));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn blocked_task_reopens_only() {
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::Open));
        assert!(!TaskStatus::Blocked.can_transition_to(TaskStatus::Closed));
        assert!(!TaskStatus::Blocked.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in TaskStatus::all() {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn effective_type_prefers_explicit_type() {
        let task = Task::new("t1", "title")
            .with_type("reasoning")
            .with_labels(vec!["summarize".into()]);
        assert_eq!(task.effective_type(), "reasoning");
    }

    #[test]
    fn effective_type_falls_back_to_labels_then_general() {
        let task = Task::new("t1", "title").with_labels(vec!["code-generation".into()]);
        assert_eq!(task.effective_type(), "code-generation");

        let task = Task::new("t2", "title");
        assert_eq!(task.effective_type(), "general");
    }

    #[test]
    fn task_serializes_type_field_name() {
        let task = Task::new("t1", "title").with_type("text-processing");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "text-processing");
        assert_eq!(json["status"], "open");
    }
}
