//! The session state machine and its environment lifecycle driver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use fleece_container::{
    provision_with_retry, EnvironmentHandle, EnvironmentProvider, EnvironmentSpec,
    HealthStatus,
};
use fleece_core::current_unix_timestamp_ms;
use fleece_session::{
    AgentError, AgentMessage, ExecutionMode, SessionRecord, SessionStatus, SessionStore,
    RESUMABLE_STATES,
};
use fleece_tracker::IssueStore;
use fleece_vcs::{generate_branch_name, worktree_dir_name};

use crate::agent::AgentStreamSource;
use crate::config::OrchestratorConfig;
use crate::events::{EventSink, OrchestratorEvent};

#[derive(Debug, Clone)]
/// Everything needed to begin work on an issue.
pub struct StartSessionRequest {
    pub issue_id: String,
    pub project_id: String,
    pub model: String,
    pub mode: ExecutionMode,
    /// Directory worktrees for this project live under.
    pub workspace_root: PathBuf,
    pub git_author_name: String,
    pub git_author_email: String,
    pub credential_token: Option<String>,
}

/// Drives sessions through their lifecycle.
///
/// Commands against one session are serialized behind a per-session lock;
/// commands against different sessions proceed independently. The record in
/// the backing store is the single source of truth for session state.
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    sessions: SessionStore,
    issues: Arc<dyn IssueStore>,
    provider: Arc<dyn EnvironmentProvider>,
    agent: Arc<dyn AgentStreamSource>,
    events: Arc<dyn EventSink>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    stop_signals: StdMutex<HashMap<String, watch::Sender<bool>>>,
    next_session: AtomicU64,
}

impl SessionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        sessions: SessionStore,
        issues: Arc<dyn IssueStore>,
        provider: Arc<dyn EnvironmentProvider>,
        agent: Arc<dyn AgentStreamSource>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions,
                issues,
                provider,
                agent,
                events,
                locks: StdMutex::new(HashMap::new()),
                stop_signals: StdMutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, AgentError> {
        self.inner.load_optional(session_id)
    }

    /// Creates a session for the issue, provisions its environment, and
    /// starts consuming the agent's message stream.
    pub async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<SessionRecord, AgentError> {
        let inner = Arc::clone(&self.inner);

        let issue = inner
            .issues
            .get(&request.project_id, &request.issue_id)
            .await
            .map_err(|e| AgentError::Store {
                message: format!("issue lookup failed: {e}"),
            })?
            .ok_or_else(|| AgentError::Store {
                message: format!(
                    "issue '{}' not found in project '{}'",
                    request.issue_id, request.project_id
                ),
            })?;

        let sequence = inner.next_session.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("session-{sequence}");
        let lock = inner.session_lock(&session_id);
        let _guard = lock.lock().await;

        let mut record = SessionRecord::new(
            &session_id,
            &request.issue_id,
            &request.project_id,
            &request.model,
            request.mode,
        );
        inner.sessions.save(&mut record)?;

        // Branch name is derived from the issue as it is right now; it is
        // regenerated here, immediately before the worktree binds to it.
        let branch = generate_branch_name(
            &issue.id,
            &issue.issue_type,
            &issue.title,
            issue.working_branch_id.as_deref(),
        );
        let working_dir = request.workspace_root.join(worktree_dir_name(&branch));
        let spec = EnvironmentSpec {
            session_id: session_id.clone(),
            branch,
            working_dir,
            env: Default::default(),
            git_author_name: request.git_author_name.clone(),
            git_author_email: request.git_author_email.clone(),
            credential_token: request.credential_token.clone(),
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        inner.register_stop_signal(&session_id, stop_tx);

        let (provisioned, attempts) =
            provision_with_retry(inner.provider.as_ref(), &spec, &inner.config.provision, &mut stop_rx)
                .await;
        record.provision_attempts = attempts;
        let handle = match provisioned {
            Ok(handle) => handle,
            Err(startup) => {
                if *stop_rx.borrow() {
                    // A stop arrived while provisioning; the session ends
                    // cleanly instead of as a failure.
                    if let Err(status_error) =
                        inner.set_status(&mut record, SessionStatus::Stopped).await
                    {
                        warn!(session_id = %record.id, "stop during provisioning: {status_error}");
                    }
                } else {
                    inner.fail_session(&mut record, &startup).await;
                }
                inner.forget_session(&session_id);
                return Err(startup);
            }
        };

        record.bind_environment(&handle.id, &handle.name);
        inner
            .set_status(&mut record, SessionStatus::RunningHooks)
            .await?;
        inner
            .emit(
                "session.started",
                &record,
                json!({ "environment": handle.id, "attempts": attempts }),
            )
            .await;

        let loop_inner = Arc::clone(&inner);
        let loop_session = session_id.clone();
        tokio::spawn(async move {
            let done_inner = Arc::clone(&loop_inner);
            let done_session = loop_session.clone();
            SessionLoop {
                inner: loop_inner,
                session_id: loop_session,
                spec,
                handle,
                reconnected: false,
                stop_rx,
            }
            .run()
            .await;
            // The loop only returns once the session is terminal; its lock
            // and stop signal are no longer needed.
            done_inner.forget_session(&done_session);
        });

        inner.load(&session_id)
    }

    /// Resumes a waiting session with new operator input.
    pub async fn resume_session(
        &self,
        session_id: &str,
        input: &str,
    ) -> Result<SessionRecord, AgentError> {
        self.deliver_input(session_id, input, "session.resumed").await
    }

    /// Answers the session's pending question.
    pub async fn answer_question(
        &self,
        session_id: &str,
        answer: &str,
    ) -> Result<SessionRecord, AgentError> {
        self.deliver_input(session_id, answer, "session.answered").await
    }

    /// Stops the session: cancels in-flight work, clears the environment
    /// binding, and tears the environment down. Idempotent; stopping an
    /// already-terminal session is a no-op.
    pub async fn stop_session(&self, session_id: &str) -> Result<SessionRecord, AgentError> {
        let inner = Arc::clone(&self.inner);
        // Signalled before the lock so a stop lands even while `start_session`
        // still holds the lock through provisioning.
        inner.signal_stop(session_id);
        let lock = inner.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = inner.load(session_id)?;
        if record.status.is_terminal() {
            debug!(session_id, "stop requested for terminal session");
            inner.forget_session(session_id);
            return Ok(record);
        }

        let handle = record.environment_handle();
        // The binding is cleared (and persisted) before teardown so no
        // observer ever sees a session pointing at a dead environment.
        record.clear_environment();
        inner.sessions.save(&mut record)?;
        if let Some(handle) = handle {
            inner.provider.stop(&handle).await?;
        }

        inner.set_status(&mut record, SessionStatus::Stopped).await?;
        inner
            .emit("session.stopped", &record, json!({}))
            .await;
        inner.forget_session(session_id);
        Ok(record)
    }

    async fn deliver_input(
        &self,
        session_id: &str,
        input: &str,
        event_kind: &str,
    ) -> Result<SessionRecord, AgentError> {
        let inner = Arc::clone(&self.inner);
        let lock = inner.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = inner.load(session_id)?;
        if !record.status.can_resume() {
            return Err(AgentError::StateMismatch {
                session_id: session_id.to_string(),
                current: record.status,
                expected: RESUMABLE_STATES.to_vec(),
            });
        }

        let handle = record.environment_handle().ok_or_else(|| {
            AgentError::ConnectionLost {
                session_id: session_id.to_string(),
                message: "session has no bound environment".to_string(),
            }
        })?;
        inner.agent.send_input(&handle, input).await?;

        record.pending_question = None;
        if record.status == SessionStatus::WaitingForPlanExecution {
            record.pending_plan = None;
        }
        inner.set_status(&mut record, SessionStatus::Running).await?;
        inner.emit(event_kind, &record, json!({})).await;
        Ok(record)
    }

    #[cfg(test)]
    pub(crate) fn tracked_session_entries(&self) -> (usize, usize) {
        let locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len();
        let signals = self
            .inner
            .stop_signals
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len();
        (locks, signals)
    }
}

impl Inner {
    fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poison| poison.into_inner());
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn register_stop_signal(&self, session_id: &str, sender: watch::Sender<bool>) {
        let mut signals = self
            .stop_signals
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        signals.insert(session_id.to_string(), sender);
    }

    /// Sheds the per-session lock and stop signal of a terminal session;
    /// both maps hold entries for live sessions only.
    fn forget_session(&self, session_id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(session_id);
        self.stop_signals
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(session_id);
    }

    fn signal_stop(&self, session_id: &str) {
        let signals = self
            .stop_signals
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(sender) = signals.get(session_id) {
            let _ = sender.send(true);
        }
    }

    fn load(&self, session_id: &str) -> Result<SessionRecord, AgentError> {
        self.load_optional(session_id)?
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    fn load_optional(&self, session_id: &str) -> Result<Option<SessionRecord>, AgentError> {
        self.sessions.get(session_id).map_err(|e| AgentError::Store {
            message: e.to_string(),
        })
    }

    async fn set_status(
        &self,
        record: &mut SessionRecord,
        status: SessionStatus,
    ) -> Result<(), AgentError> {
        if record.status == status {
            return Ok(());
        }
        let previous = record.status;
        record.status = status;
        record.touch();
        self.sessions.save(record)?;
        debug!(
            session_id = %record.id,
            from = %previous,
            to = %status,
            "session status changed"
        );
        self.emit(
            "session.status_changed",
            record,
            json!({ "from": previous.to_string(), "to": status.to_string() }),
        )
        .await;
        Ok(())
    }

    /// Moves the session to `Error` with the failure stored for diagnosis.
    async fn fail_session(&self, record: &mut SessionRecord, cause: &AgentError) {
        error!(session_id = %record.id, "session failed: {cause}");
        record.last_error = Some(cause.to_string());
        let handle = record.environment_handle();
        record.clear_environment();
        if let Err(save_error) = self.sessions.save(record) {
            error!(session_id = %record.id, "failed to persist failure: {save_error}");
        }
        if let Some(handle) = handle {
            if let Err(stop_error) = self.provider.stop(&handle).await {
                warn!(session_id = %record.id, "teardown after failure: {stop_error}");
            }
        }
        if let Err(status_error) = self.set_status(record, SessionStatus::Error).await {
            error!(session_id = %record.id, "failed to mark error: {status_error}");
        }
    }

    async fn emit(&self, kind: &str, record: &SessionRecord, payload: serde_json::Value) {
        let event = OrchestratorEvent::new(kind, &record.id, &record.project_id, payload)
            .with_dedup_key(format!("{kind}:{}:{}", record.id, record.status));
        self.events.publish(event).await;
    }
}

/// Extension on the record for rebuilding the provider handle.
trait EnvironmentBinding {
    fn environment_handle(&self) -> Option<EnvironmentHandle>;
}

impl EnvironmentBinding for SessionRecord {
    fn environment_handle(&self) -> Option<EnvironmentHandle> {
        match (&self.container_id, &self.container_name) {
            (Some(id), Some(name)) => Some(EnvironmentHandle {
                id: id.clone(),
                name: name.clone(),
            }),
            _ => None,
        }
    }
}

/// Consumes one session's agent stream until the session ends.
struct SessionLoop {
    inner: Arc<Inner>,
    session_id: String,
    spec: EnvironmentSpec,
    handle: EnvironmentHandle,
    reconnected: bool,
    stop_rx: watch::Receiver<bool>,
}

enum LoopStep {
    Continue,
    Finished,
}

impl SessionLoop {
    async fn run(mut self) {
        loop {
            let mut stream = match self.inner.agent.open_stream(&self.handle).await {
                Ok(stream) => stream,
                Err(open_error) => {
                    let lost = AgentError::ConnectionLost {
                        session_id: self.session_id.clone(),
                        message: open_error.to_string(),
                    };
                    match self.handle_connection_loss(lost).await {
                        LoopStep::Continue => continue,
                        LoopStep::Finished => return,
                    }
                }
            };

            let idle_window = Duration::from_millis(self.inner.config.idle_window_ms.max(1));
            let health_interval =
                Duration::from_millis(self.inner.config.health_check_interval_ms.max(1));
            let mut health_timer = tokio::time::interval(health_interval);
            health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut stream_closed = false;

            loop {
                if self.timed_out().await {
                    return;
                }
                tokio::select! {
                    changed = self.stop_rx.changed() => {
                        if changed.is_err() || *self.stop_rx.borrow() {
                            debug!(session_id = %self.session_id, "stream consumer unwinding on stop");
                            return;
                        }
                    }
                    message = tokio::time::timeout(idle_window, async {
                        if stream_closed {
                            futures_util::future::pending::<Option<AgentMessage>>().await
                        } else {
                            stream.next().await
                        }
                    }) => {
                        match message {
                            Ok(Some(message)) => {
                                match self.apply_message(message).await {
                                    LoopStep::Continue => {}
                                    LoopStep::Finished => return,
                                }
                            }
                            Ok(None) => {
                                // Stream closed: the agent finished its turn.
                                stream_closed = true;
                                self.classify_idle().await;
                            }
                            Err(_idle) => {
                                self.classify_idle().await;
                            }
                        }
                    }
                    _ = health_timer.tick() => {
                        let health = self.inner.provider.health_check(&self.handle).await;
                        let lost = match health {
                            Ok(HealthStatus::Alive) => None,
                            Ok(HealthStatus::Lost) => Some(AgentError::ConnectionLost {
                                session_id: self.session_id.clone(),
                                message: "environment health probe reported lost".to_string(),
                            }),
                            Err(probe_error) => Some(probe_error),
                        };
                        if let Some(lost) = lost {
                            match self.handle_connection_loss(lost).await {
                                LoopStep::Continue => break,
                                LoopStep::Finished => return,
                            }
                        }
                    }
                }
            }
        }
    }

    async fn with_record<F>(&self, apply: F) -> Option<SessionRecord>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let lock = self.inner.session_lock(&self.session_id);
        let _guard = lock.lock().await;
        let mut record = match self.inner.load(&self.session_id) {
            Ok(record) => record,
            Err(load_error) => {
                warn!(session_id = %self.session_id, "stream consumer lost record: {load_error}");
                return None;
            }
        };
        if record.status.is_terminal() {
            return Some(record);
        }
        apply(&mut record);
        record.touch();
        if let Err(save_error) = self.inner.sessions.save(&mut record) {
            warn!(session_id = %self.session_id, "stream consumer save failed: {save_error}");
        }
        Some(record)
    }

    async fn apply_message(&mut self, message: AgentMessage) -> LoopStep {
        match message {
            AgentMessage::HookStarted { name } => {
                debug!(session_id = %self.session_id, hook = %name, "hook started");
                self.with_record(|_| {}).await;
                LoopStep::Continue
            }
            AgentMessage::HookFinished { name } => {
                debug!(session_id = %self.session_id, hook = %name, "hook finished");
                self.transition_if(SessionStatus::RunningHooks, SessionStatus::Running)
                    .await;
                LoopStep::Continue
            }
            AgentMessage::Text { cost_usd, .. } => {
                self.with_record(|record| {
                    record.message_count = record.message_count.saturating_add(1);
                    record.total_cost_usd += cost_usd;
                })
                .await;
                LoopStep::Continue
            }
            AgentMessage::ToolUse { name } => {
                debug!(session_id = %self.session_id, tool = %name, "tool use");
                self.with_record(|record| {
                    record.message_count = record.message_count.saturating_add(1);
                })
                .await;
                LoopStep::Continue
            }
            AgentMessage::Question { prompt } => {
                let session_id = self.session_id.clone();
                self.with_record(|record| {
                    if record.pending_question.is_some() {
                        // At most one pending question; the newest wins.
                        warn!(session_id = %session_id, "new question replaces pending one");
                    }
                    record.pending_question = Some(prompt);
                })
                .await;
                LoopStep::Continue
            }
            AgentMessage::PlanReady { plan } => {
                let lock = self.inner.session_lock(&self.session_id);
                let _guard = lock.lock().await;
                if let Ok(mut record) = self.inner.load(&self.session_id) {
                    if record.status.is_terminal() {
                        return LoopStep::Finished;
                    }
                    record.message_count = record.message_count.saturating_add(1);
                    if record.mode == ExecutionMode::Plan {
                        record.pending_plan = Some(plan);
                        if let Err(status_error) = self
                            .inner
                            .set_status(&mut record, SessionStatus::WaitingForPlanExecution)
                            .await
                        {
                            warn!(session_id = %self.session_id, "plan hold failed: {status_error}");
                        }
                    } else if let Err(save_error) = self.inner.sessions.save(&mut record) {
                        warn!(session_id = %self.session_id, "plan save failed: {save_error}");
                    }
                }
                LoopStep::Continue
            }
            AgentMessage::Exited { code, stderr } => {
                if code == 0 {
                    info!(session_id = %self.session_id, "agent exited cleanly");
                    self.finish_stopped().await;
                } else {
                    let failure = AgentError::CliFailure {
                        session_id: self.session_id.clone(),
                        exit_code: Some(code),
                        stderr,
                    };
                    self.finish_failed(failure).await;
                }
                LoopStep::Finished
            }
        }
    }

    async fn transition_if(&self, from: SessionStatus, to: SessionStatus) {
        let lock = self.inner.session_lock(&self.session_id);
        let _guard = lock.lock().await;
        if let Ok(mut record) = self.inner.load(&self.session_id) {
            if record.status == from {
                if let Err(status_error) = self.inner.set_status(&mut record, to).await {
                    warn!(session_id = %self.session_id, "transition failed: {status_error}");
                }
            }
        }
    }

    /// An idle window elapsed: a running session is reclassified as waiting.
    async fn classify_idle(&self) {
        let lock = self.inner.session_lock(&self.session_id);
        let _guard = lock.lock().await;
        if let Ok(mut record) = self.inner.load(&self.session_id) {
            if record.status != SessionStatus::Running {
                return;
            }
            let target = if record.pending_question.is_some() {
                SessionStatus::WaitingForQuestionAnswer
            } else {
                SessionStatus::WaitingForInput
            };
            if let Err(status_error) = self.inner.set_status(&mut record, target).await {
                warn!(session_id = %self.session_id, "idle transition failed: {status_error}");
            }
        }
    }

    async fn timed_out(&self) -> bool {
        let lock = self.inner.session_lock(&self.session_id);
        let _guard = lock.lock().await;
        let Ok(mut record) = self.inner.load(&self.session_id) else {
            return true;
        };
        if record.status.is_terminal() {
            return true;
        }
        let elapsed = current_unix_timestamp_ms().saturating_sub(record.last_activity_unix_ms);
        if elapsed < self.inner.config.max_session_duration_ms {
            return false;
        }
        let timeout = AgentError::Timeout {
            session_id: self.session_id.clone(),
            elapsed_ms: elapsed,
        };
        self.inner.fail_session(&mut record, &timeout).await;
        true
    }

    /// One reconnect is attempted per session; a second loss is terminal.
    async fn handle_connection_loss(&mut self, lost: AgentError) -> LoopStep {
        warn!(session_id = %self.session_id, "{lost}");
        if self.reconnected {
            self.finish_failed(lost).await;
            return LoopStep::Finished;
        }
        self.reconnected = true;

        // The binding is cleared (and persisted) before teardown so no
        // observer ever sees a session pointing at a dead environment.
        let old_handle = self.handle.clone();
        self.with_record(|record| {
            record.clear_environment();
        })
        .await;
        let _ = self.inner.provider.stop(&old_handle).await;
        match self.inner.provider.start(&self.spec).await {
            Ok(new_handle) => {
                info!(
                    session_id = %self.session_id,
                    environment = %new_handle.id,
                    "reconnected to a fresh environment"
                );
                self.handle = new_handle.clone();
                self.with_record(|record| {
                    record.bind_environment(&new_handle.id, &new_handle.name);
                })
                .await;
                LoopStep::Continue
            }
            Err(_reconnect_error) => {
                self.finish_failed(lost).await;
                LoopStep::Finished
            }
        }
    }

    async fn finish_stopped(&self) {
        let lock = self.inner.session_lock(&self.session_id);
        let _guard = lock.lock().await;
        if let Ok(mut record) = self.inner.load(&self.session_id) {
            if record.status.is_terminal() {
                return;
            }
            let handle = record.environment_handle();
            record.clear_environment();
            if let Err(save_error) = self.inner.sessions.save(&mut record) {
                warn!(session_id = %self.session_id, "unbind save failed: {save_error}");
            }
            if let Some(handle) = handle {
                let _ = self.inner.provider.stop(&handle).await;
            }
            if let Err(status_error) = self
                .inner
                .set_status(&mut record, SessionStatus::Stopped)
                .await
            {
                warn!(session_id = %self.session_id, "stop transition failed: {status_error}");
            }
        }
    }

    async fn finish_failed(&self, cause: AgentError) {
        let lock = self.inner.session_lock(&self.session_id);
        let _guard = lock.lock().await;
        if let Ok(mut record) = self.inner.load(&self.session_id) {
            if record.status.is_terminal() {
                return;
            }
            self.inner.fail_session(&mut record, &cause).await;
        }
    }
}
