use thiserror::Error;

use yggdrasil_domain::TaskStatus;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("ledger error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("task not found: {id}")]
    TaskNotFound { id: String },
    #[error("invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },
    #[error("memory exhausted on {host}: {message}")]
    MemoryExhausted { host: String, message: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("no hosts available for task type {task_type}")]
    AllHostsUnavailable { task_type: String },
    #[error("shutting down")]
    Shutdown,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the retry/breaker client may recover from this failure by
    /// trying again (same host or the next candidate).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Timeout(_)
                | DispatchError::ConnectionFailed(_)
                | DispatchError::ServerError { .. }
                | DispatchError::MemoryExhausted { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::Configuration(_) | DispatchError::Database(_)
        )
    }

    /// Stable kind string carried in structured events and error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Database(_) => "database",
            DispatchError::TaskNotFound { .. } => "not_found",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::Conflict(_) => "conflict",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::ConnectionFailed(_) => "connection_failed",
            DispatchError::ServerError { .. } => "server_error",
            DispatchError::MemoryExhausted { .. } => "memory_exhausted",
            DispatchError::InvalidPayload(_) => "invalid_payload",
            DispatchError::AllHostsUnavailable { .. } => "all_hosts_unavailable",
            DispatchError::Shutdown => "shutdown",
            DispatchError::Serialization(_) => "serialization",
            DispatchError::Configuration(_) => "configuration",
            DispatchError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        assert!(DispatchError::Timeout("read".into()).is_retryable());
        assert!(DispatchError::ConnectionFailed("refused".into()).is_retryable());
        assert!(DispatchError::ServerError {
            status: 503,
            message: "overloaded".into()
        }
        .is_retryable());
        assert!(DispatchError::MemoryExhausted {
            host: "surtr-reasoning".into(),
            message: "CUDA out of memory".into()
        }
        .is_retryable());
    }

    #[test]
    fn caller_errors_are_not_retryable() {
        assert!(!DispatchError::InvalidPayload("bad json".into()).is_retryable());
        assert!(!DispatchError::task_not_found("t1").is_retryable());
        assert!(!DispatchError::Shutdown.is_retryable());
        assert!(!DispatchError::AllHostsUnavailable {
            task_type: "reasoning".into()
        }
        .is_retryable());
    }

    #[test]
    fn kind_strings_match_report_vocabulary() {
        assert_eq!(
            DispatchError::InvalidTransition {
                task_id: "t1".into(),
                from: TaskStatus::Closed,
                to: TaskStatus::Open,
            }
            .kind(),
            "invalid_transition"
        );
        assert_eq!(DispatchError::Timeout("x".into()).kind(), "timeout");
        assert_eq!(
            DispatchError::AllHostsUnavailable {
                task_type: "general".into()
            }
            .kind(),
            "all_hosts_unavailable"
        );
    }
}
