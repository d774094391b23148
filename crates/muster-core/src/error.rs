//! Error taxonomy for the routing core

use thiserror::Error;

use crate::types::TaskStatus;

/// Errors returned by registry, memory and task operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown agent or task id
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate agent id on add
    #[error("agent '{0}' already exists")]
    AlreadyExists(String),

    /// Registry is full
    #[error("registry is full ({0} agents max)")]
    CapacityExceeded(usize),

    /// Malformed input: missing fields, bad names, bad progress values
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Update attempted on a task that already finished
    #[error("task '{id}' is already {status}")]
    TerminalState { id: String, status: TaskStatus },

    /// Backing store failure
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn agent_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "agent",
            id: id.into(),
        }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.into(),
        }
    }

    /// Stable code for logs and replies
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::TerminalState { .. } => "TERMINAL_STATE",
            Self::Storage(_) => "STORAGE",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Conversational engine failure. Carries a short diagnostic only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine timed out after {0}s")]
    Timeout(u64),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine returned an unusable response: {0}")]
    BadResponse(String),
}

/// Outbound notification failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notifier timed out after {0}s")]
    Timeout(u64),

    #[error("notifier failed: {0}")]
    Failed(String),
}

/// Clip a collaborator diagnostic to a short, single-line message
pub(crate) fn short_diagnostic(raw: &str) -> String {
    let line = raw.lines().next().unwrap_or("").trim();
    crate::types::truncate_chars(line, 160)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CoreError::agent_not_found("a9").to_string(),
            "agent 'a9' not found"
        );
        assert_eq!(
            CoreError::CapacityExceeded(2).to_string(),
            "registry is full (2 agents max)"
        );
        let err = CoreError::TerminalState {
            id: "t1".into(),
            status: TaskStatus::Completed,
        };
        assert_eq!(err.to_string(), "task 't1' is already completed");
        assert_eq!(err.error_code(), "TERMINAL_STATE");
    }

    #[test]
    fn test_storage_wraps_anyhow() {
        let err: CoreError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.error_code(), "STORAGE");
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_short_diagnostic_is_single_line() {
        let diag = short_diagnostic("connection refused\n  at stack frame 1\n  at frame 2");
        assert_eq!(diag, "connection refused");
        let long = "x".repeat(500);
        assert_eq!(short_diagnostic(&long).chars().count(), 160);
    }
}
