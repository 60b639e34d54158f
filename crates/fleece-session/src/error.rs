use thiserror::Error;

use crate::record::SessionStatus;

/// The finite taxonomy of execution failures.
///
/// Retry eligibility is fixed per variant at construction and never mutated;
/// callers branch on `is_retryable`, not on downcasting.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("failed to start execution environment{}: {message}", fmt_session(.session_id))]
    Startup {
        session_id: Option<String>,
        message: String,
    },
    #[error("lost connection to execution environment for session '{session_id}': {message}")]
    ConnectionLost { session_id: String, message: String },
    #[error("session '{session_id}' timed out after {elapsed_ms}ms without progress")]
    Timeout { session_id: String, elapsed_ms: u64 },
    #[error(
        "agent process for session '{session_id}' failed with exit code {}: {stderr}",
        .exit_code.map_or_else(|| "unknown".to_string(), |code| code.to_string())
    )]
    CliFailure {
        session_id: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("session '{session_id}' was not found")]
    SessionNotFound { session_id: String },
    #[error(
        "session '{session_id}' is in state '{current}' but the command expects one of [{}]",
        fmt_states(.expected)
    )]
    StateMismatch {
        session_id: String,
        current: SessionStatus,
        expected: Vec<SessionStatus>,
    },
    #[error("{message}")]
    Store { message: String },
    #[error("concurrent update conflict: {message}")]
    Conflict { message: String },
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Startup { .. } | Self::ConnectionLost { .. } => true,
            Self::Timeout { .. }
            | Self::CliFailure { .. }
            | Self::SessionNotFound { .. }
            | Self::StateMismatch { .. }
            | Self::Store { .. }
            | Self::Conflict { .. } => false,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Startup { session_id, .. } => session_id.as_deref(),
            Self::ConnectionLost { session_id, .. }
            | Self::Timeout { session_id, .. }
            | Self::CliFailure { session_id, .. }
            | Self::SessionNotFound { session_id }
            | Self::StateMismatch { session_id, .. } => Some(session_id),
            Self::Store { .. } | Self::Conflict { .. } => None,
        }
    }
}

fn fmt_session(session_id: &Option<String>) -> String {
    match session_id {
        Some(id) => format!(" for session '{id}'"),
        None => String::new(),
    }
}

fn fmt_states(states: &[SessionStatus]) -> String {
    states
        .iter()
        .map(|state| state.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
