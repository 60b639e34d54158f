use serde::{Deserialize, Serialize};

use fleece_core::current_unix_timestamp_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SessionStatus` values.
pub enum SessionStatus {
    Starting,
    RunningHooks,
    Running,
    WaitingForInput,
    WaitingForQuestionAnswer,
    WaitingForPlanExecution,
    Stopped,
    Error,
}

/// States from which a resume or answer command is legal.
pub const RESUMABLE_STATES: [SessionStatus; 3] = [
    SessionStatus::WaitingForInput,
    SessionStatus::WaitingForQuestionAnswer,
    SessionStatus::WaitingForPlanExecution,
];

impl SessionStatus {
    /// Terminal for the current environment binding; a restart opens a new one.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn can_resume(self) -> bool {
        RESUMABLE_STATES.contains(&self)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::RunningHooks => "running_hooks",
            Self::Running => "running",
            Self::WaitingForInput => "waiting_for_input",
            Self::WaitingForQuestionAnswer => "waiting_for_question_answer",
            Self::WaitingForPlanExecution => "waiting_for_plan_execution",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ExecutionMode` values.
pub enum ExecutionMode {
    Plan,
    Build,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One tracked unit of agent work and its optional environment binding.
///
/// The record outlives its execution environment: after teardown the binding
/// fields are cleared and the status is terminal, but the row persists for
/// history. At most one environment is ever bound at a time, and the binding
/// is cleared before the environment is torn down.
pub struct SessionRecord {
    pub id: String,
    pub entity_id: String,
    pub project_id: String,
    pub model: String,
    pub mode: ExecutionMode,
    pub status: SessionStatus,
    pub created_unix_ms: u64,
    pub last_activity_unix_ms: u64,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub pending_plan: Option<String>,
    #[serde(default)]
    pub pending_question: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub provision_attempts: u32,
    #[serde(default)]
    pub revision: u64,
}

impl SessionRecord {
    pub fn new(
        id: impl Into<String>,
        entity_id: impl Into<String>,
        project_id: impl Into<String>,
        model: impl Into<String>,
        mode: ExecutionMode,
    ) -> Self {
        let now = current_unix_timestamp_ms();
        Self {
            id: id.into(),
            entity_id: entity_id.into(),
            project_id: project_id.into(),
            model: model.into(),
            mode,
            status: SessionStatus::Starting,
            created_unix_ms: now,
            last_activity_unix_ms: now,
            message_count: 0,
            total_cost_usd: 0.0,
            container_id: None,
            container_name: None,
            pending_plan: None,
            pending_question: None,
            last_error: None,
            provision_attempts: 0,
            revision: 0,
        }
    }

    pub fn bind_environment(&mut self, container_id: impl Into<String>, name: impl Into<String>) {
        self.container_id = Some(container_id.into());
        self.container_name = Some(name.into());
    }

    /// Clears the binding. Must happen before the environment is torn down.
    pub fn clear_environment(&mut self) {
        self.container_id = None;
        self.container_name = None;
    }

    pub fn has_bound_environment(&self) -> bool {
        self.container_id.is_some()
    }

    pub fn touch(&mut self) {
        self.last_activity_unix_ms = current_unix_timestamp_ms();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// One message observed on the opaque agent process's output stream.
pub enum AgentMessage {
    HookStarted { name: String },
    HookFinished { name: String },
    Text { content: String, cost_usd: f64 },
    Question { prompt: String },
    PlanReady { plan: String },
    ToolUse { name: String },
    Exited { code: i32, stderr: String },
}
