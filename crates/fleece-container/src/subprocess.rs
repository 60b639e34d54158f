use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use fleece_session::AgentError;

use crate::provider::{EnvironmentHandle, EnvironmentProvider, EnvironmentSpec, HealthStatus};

const CREDENTIAL_TOKEN_ENV: &str = "FLEECE_GIT_TOKEN";

/// Runs the agent CLI as a child process inside the session's worktree.
///
/// Each environment gets its own process env carrying the git identity and
/// credential token, so nothing credential-shaped ever lands in a shared
/// file two environments could race on.
pub struct SubprocessEnvironmentProvider {
    command: String,
    args: Vec<String>,
    next_id: AtomicU64,
    children: AsyncMutex<HashMap<String, ManagedChild>>,
}

/// A running child together with the session it executes; failure
/// diagnostics carry the session id, not the environment name.
struct ManagedChild {
    session_id: String,
    child: Child,
}

impl SubprocessEnvironmentProvider {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            next_id: AtomicU64::new(1),
            children: AsyncMutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EnvironmentProvider for SubprocessEnvironmentProvider {
    async fn start(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, AgentError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("GIT_AUTHOR_NAME", &spec.git_author_name)
            .env("GIT_AUTHOR_EMAIL", &spec.git_author_email)
            .env("GIT_COMMITTER_NAME", &spec.git_author_name)
            .env("GIT_COMMITTER_EMAIL", &spec.git_author_email)
            .env("FLEECE_BRANCH", &spec.branch);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(token) = &spec.credential_token {
            command.env(CREDENTIAL_TOKEN_ENV, token);
        }

        let child = command.spawn().map_err(|error| AgentError::Startup {
            session_id: Some(spec.session_id.clone()),
            message: format!(
                "failed to spawn '{}' in {}: {error}",
                self.command,
                spec.working_dir.display()
            ),
        })?;

        let sequence = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = EnvironmentHandle {
            id: format!("env-{sequence}"),
            name: format!("fleece-{}", spec.session_id),
        };
        info!(
            session_id = %spec.session_id,
            environment = %handle.id,
            branch = %spec.branch,
            "started execution environment"
        );
        self.children.lock().await.insert(
            handle.id.clone(),
            ManagedChild {
                session_id: spec.session_id.clone(),
                child,
            },
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &EnvironmentHandle) -> Result<(), AgentError> {
        let entry = self.children.lock().await.remove(&handle.id);
        let Some(mut entry) = entry else {
            // Already gone: teardown is idempotent.
            debug!(environment = %handle.id, "stop requested for unknown environment");
            return Ok(());
        };
        if let Err(error) = entry.child.start_kill() {
            if error.kind() != std::io::ErrorKind::InvalidInput {
                debug!(environment = %handle.id, "kill failed: {error}");
            }
        }
        let _ = entry.child.wait().await;
        info!(environment = %handle.id, "stopped execution environment");
        Ok(())
    }

    async fn health_check(&self, handle: &EnvironmentHandle) -> Result<HealthStatus, AgentError> {
        let mut children = self.children.lock().await;
        let Some(entry) = children.get_mut(&handle.id) else {
            return Ok(HealthStatus::Lost);
        };
        match entry.child.try_wait() {
            Ok(None) => Ok(HealthStatus::Alive),
            Ok(Some(_)) => Ok(HealthStatus::Lost),
            Err(error) => Err(AgentError::ConnectionLost {
                session_id: entry.session_id.clone(),
                message: format!("health probe failed: {error}"),
            }),
        }
    }
}
