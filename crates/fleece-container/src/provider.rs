use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use fleece_session::AgentError;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Opaque identifier/name pair for one live execution environment.
///
/// Owned by exactly one session for its lifetime; the session stores the
/// handle and never the environment's resources.
pub struct EnvironmentHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
/// Everything a provider needs to bring up an environment for one session.
pub struct EnvironmentSpec {
    pub session_id: String,
    pub branch: String,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub git_author_name: String,
    pub git_author_email: String,
    /// Injected into the environment's own process env, never written to a
    /// location another environment could read.
    pub credential_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `HealthStatus` values.
pub enum HealthStatus {
    Alive,
    Lost,
}

#[async_trait]
/// Trait contract for `EnvironmentProvider` behavior.
pub trait EnvironmentProvider: Send + Sync {
    /// Provisions an environment bound to the spec's branch and worktree.
    /// Failures surface as `AgentError::Startup` (retryable by the caller).
    async fn start(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, AgentError>;

    /// Tears the environment down. Idempotent: stopping an environment that
    /// is already gone is not an error.
    async fn stop(&self, handle: &EnvironmentHandle) -> Result<(), AgentError>;

    /// Non-blocking liveness probe. A `Lost` result is reported to the
    /// orchestrator as a connection-loss event, never retried here.
    async fn health_check(&self, handle: &EnvironmentHandle) -> Result<HealthStatus, AgentError>;
}
