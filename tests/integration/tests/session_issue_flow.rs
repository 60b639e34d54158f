//! End-to-end flows across the session orchestrator, the issue store, and
//! the PR linking engine, with scripted environment and agent fakes.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use fleece_container::{
    EnvironmentHandle, EnvironmentProvider, EnvironmentSpec, HealthStatus,
};
use fleece_core::RetryPolicy;
use fleece_orchestrator::{
    AgentStream, AgentStreamSource, EventSink, OrchestratorConfig, OrchestratorEvent,
    SessionOrchestrator, StartSessionRequest,
};
use fleece_session::{
    AgentError, AgentMessage, ExecutionMode, SessionRecord, SessionStatus, SessionStore,
};
use fleece_tracker::{
    CodeHostClient, FileIssueStore, Issue, IssueStatus, IssueStore, PrIssueLinker, PullRequest,
    PullRequestStatus,
};
use fleece_vcs::{generate_branch_name, worktree_dir_name};

struct ScriptedProvider {
    failures_before_success: usize,
    start_calls: AtomicUsize,
    specs: Mutex<Vec<EnvironmentSpec>>,
}

impl ScriptedProvider {
    fn new(failures_before_success: usize) -> Self {
        Self {
            failures_before_success,
            start_calls: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EnvironmentProvider for ScriptedProvider {
    async fn start(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, AgentError> {
        let call = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures_before_success {
            return Err(AgentError::Startup {
                session_id: Some(spec.session_id.clone()),
                message: format!("scripted provisioning failure {call}"),
            });
        }
        self.specs.lock().unwrap().push(spec.clone());
        Ok(EnvironmentHandle {
            id: format!("env-{call}"),
            name: format!("fleece-{}", spec.session_id),
        })
    }

    async fn stop(&self, _handle: &EnvironmentHandle) -> Result<(), AgentError> {
        Ok(())
    }

    async fn health_check(
        &self,
        _handle: &EnvironmentHandle,
    ) -> Result<HealthStatus, AgentError> {
        Ok(HealthStatus::Alive)
    }
}

struct ScriptedAgent {
    script: Mutex<VecDeque<AgentMessage>>,
    inputs: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    fn new(script: Vec<AgentMessage>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            inputs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentStreamSource for ScriptedAgent {
    async fn open_stream(&self, _handle: &EnvironmentHandle) -> Result<AgentStream, AgentError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut script = self.script.lock().unwrap();
        while let Some(message) = script.pop_front() {
            let _ = tx.send(message);
        }
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send_input(
        &self,
        _handle: &EnvironmentHandle,
        input: &str,
    ) -> Result<(), AgentError> {
        self.inputs.lock().unwrap().push(input.to_string());
        Ok(())
    }
}

struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: OrchestratorEvent) {}
}

/// In-memory code host: pull requests keyed by number.
#[derive(Default)]
struct FakeHost {
    pulls: Mutex<HashMap<u64, PullRequest>>,
    next_number: AtomicU64,
}

impl FakeHost {
    fn merge(&self, number: u64) {
        if let Some(pull) = self.pulls.lock().unwrap().get_mut(&number) {
            pull.status = PullRequestStatus::Merged;
        }
    }
}

#[async_trait]
impl CodeHostClient for FakeHost {
    async fn get_pull_request(&self, number: u64) -> Result<Option<PullRequest>> {
        Ok(self.pulls.lock().unwrap().get(&number).cloned())
    }

    async fn list_open_pull_requests(&self) -> Result<Vec<PullRequest>> {
        Ok(self
            .pulls
            .lock()
            .unwrap()
            .values()
            .filter(|pull| pull.status.is_open())
            .cloned()
            .collect())
    }

    async fn create_pull_request(
        &self,
        head: &str,
        _base: &str,
        _title: &str,
        _body: &str,
    ) -> Result<PullRequest> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst) + 1;
        let pull = PullRequest {
            number,
            url: format!("https://example.com/pull/{number}"),
            source_branch: head.to_string(),
            status: PullRequestStatus::ReadyForReview,
        };
        self.pulls.lock().unwrap().insert(number, pull.clone());
        Ok(pull)
    }

    async fn merge_pull_request(&self, number: u64) -> Result<bool> {
        let mut pulls = self.pulls.lock().unwrap();
        match pulls.get_mut(&number) {
            Some(pull) if pull.status.is_open() => {
                pull.status = PullRequestStatus::Merged;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pull_request_status(&self, number: u64) -> Result<PullRequestStatus> {
        Ok(self
            .pulls
            .lock()
            .unwrap()
            .get(&number)
            .map(|pull| pull.status)
            .unwrap_or(PullRequestStatus::Closed))
    }
}

struct Fixture {
    dir: TempDir,
    orchestrator: Arc<SessionOrchestrator>,
    provider: Arc<ScriptedProvider>,
    agent: Arc<ScriptedAgent>,
    issues: Arc<FileIssueStore>,
    sessions: SessionStore,
}

async fn fixture(
    config: OrchestratorConfig,
    provider: ScriptedProvider,
    agent: ScriptedAgent,
) -> Fixture {
    fleece_core::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let sessions = SessionStore::open(dir.path().join("sessions.json")).unwrap();
    let issues = Arc::new(FileIssueStore::open(dir.path().join("issues.json")).unwrap());
    let mut issue = Issue::new("X1", "proj", "bug", "Fix Login Button!!");
    issue.status = IssueStatus::InProgress;
    issues.put(&mut issue).await.unwrap();

    let provider = Arc::new(provider);
    let agent = Arc::new(agent);
    let orchestrator = Arc::new(SessionOrchestrator::new(
        config,
        sessions.clone(),
        Arc::clone(&issues) as Arc<dyn IssueStore>,
        Arc::clone(&provider) as Arc<dyn EnvironmentProvider>,
        Arc::clone(&agent) as Arc<dyn AgentStreamSource>,
        Arc::new(NullSink),
    ));
    Fixture {
        dir,
        orchestrator,
        provider,
        agent,
        issues,
        sessions,
    }
}

fn config_with_policy(policy: RetryPolicy) -> OrchestratorConfig {
    OrchestratorConfig {
        provision: policy,
        health_check_interval_ms: 60_000,
        ..OrchestratorConfig::default()
    }
}

fn request(workspace: &Path) -> StartSessionRequest {
    StartSessionRequest {
        issue_id: "X1".to_string(),
        project_id: "proj".to_string(),
        model: "default".to_string(),
        mode: ExecutionMode::Build,
        workspace_root: workspace.join("worktrees"),
        git_author_name: "Fleece".to_string(),
        git_author_email: "fleece@example.com".to_string(),
        credential_token: Some("scoped-token".to_string()),
    }
}

async fn wait_for_status(
    orchestrator: &SessionOrchestrator,
    session_id: &str,
    target: SessionStatus,
) -> SessionRecord {
    for _ in 0..300 {
        if let Some(record) = orchestrator.get_session(session_id).unwrap() {
            if record.status == target {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session '{session_id}' never reached {target}");
}

#[tokio::test]
async fn session_runs_to_completion_and_pr_merge_completes_issue() {
    let agent = ScriptedAgent::new(vec![
        AgentMessage::HookFinished {
            name: "setup".to_string(),
        },
        AgentMessage::Text {
            content: "fixed the button".to_string(),
            cost_usd: 0.05,
        },
        AgentMessage::Exited {
            code: 0,
            stderr: String::new(),
        },
    ]);
    let fix = fixture(
        config_with_policy(RetryPolicy::default()),
        ScriptedProvider::new(0),
        agent,
    )
    .await;

    let record = fix
        .orchestrator
        .start_session(request(fix.dir.path()))
        .await
        .unwrap();

    // The environment was provisioned on the branch derived from the issue,
    // inside a worktree named after that branch.
    let expected_branch = generate_branch_name("X1", "bug", "Fix Login Button!!", None);
    assert_eq!(expected_branch, "bug/fix-login-button+X1");
    let spec = fix.provider.specs.lock().unwrap()[0].clone();
    assert_eq!(spec.branch, expected_branch);
    assert!(spec
        .working_dir
        .ends_with(worktree_dir_name(&expected_branch)));
    assert_eq!(spec.credential_token.as_deref(), Some("scoped-token"));

    let stopped = wait_for_status(&fix.orchestrator, &record.id, SessionStatus::Stopped).await;
    assert!(!stopped.has_bound_environment());
    assert_eq!(stopped.message_count, 1);

    // The work lands as a pull request; the branch name carries the issue id
    // back to the tracker.
    let host = Arc::new(FakeHost::default());
    let pull = host
        .create_pull_request(&expected_branch, "main", "Fix login button", "")
        .await
        .unwrap();
    let linker = PrIssueLinker::new(
        Arc::clone(&fix.issues) as Arc<dyn IssueStore>,
        Arc::clone(&host) as Arc<dyn CodeHostClient>,
    );
    let linked = linker.link_by_branch_name("proj", pull.number).await;
    assert_eq!(linked.as_deref(), Some("X1"));

    let issue = fix.issues.get("proj", "X1").await.unwrap().unwrap();
    assert_eq!(issue.linked_pr_number, Some(pull.number));
    assert!(issue.labels.contains(&format!("pr-{}", pull.number)));

    // Merge flows back as issue completion, then close.
    host.merge(pull.number);
    let status = host.pull_request_status(pull.number).await.unwrap();
    assert!(
        linker
            .update_issue_status_from_pr("proj", "X1", status, pull.number)
            .await
    );
    let issue = fix.issues.get("proj", "X1").await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Complete);

    assert!(
        linker
            .close_linked_issue("proj", pull.number, Some("merged"))
            .await
    );
    let issue = fix.issues.get("proj", "X1").await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Closed);
    assert_eq!(issue.close_reason.as_deref(), Some("merged"));
}

#[tokio::test]
async fn stop_during_provisioning_unwinds_promptly() {
    let policy = RetryPolicy {
        max_attempts: 10,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
    };
    let fix = fixture(
        config_with_policy(policy),
        ScriptedProvider::new(100),
        ScriptedAgent::new(vec![]),
    )
    .await;

    let orchestrator = Arc::clone(&fix.orchestrator);
    let workspace = fix.dir.path().to_path_buf();
    let starter =
        tokio::spawn(async move { orchestrator.start_session(request(&workspace)).await });

    // Let the first attempt fail and the backoff sleep begin.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stopped = fix.orchestrator.stop_session("session-1").await.unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);

    let start_result = starter.await.unwrap();
    let error = start_result.unwrap_err();
    assert!(error.to_string().contains("cancelled by stop request"));
    // The stop cut provisioning short instead of spending the retry budget.
    assert!(fix.provider.start_calls.load(Ordering::SeqCst) <= 3);

    let record = fix
        .orchestrator
        .get_session("session-1")
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SessionStatus::Stopped);
    assert!(record.last_error.is_none());
}

#[tokio::test]
async fn idle_session_waits_for_input_and_resumes() {
    let agent = ScriptedAgent::new(vec![
        AgentMessage::HookFinished {
            name: "setup".to_string(),
        },
        AgentMessage::Text {
            content: "first pass done".to_string(),
            cost_usd: 0.01,
        },
    ]);
    let fix = fixture(
        config_with_policy(RetryPolicy::default()),
        ScriptedProvider::new(0),
        agent,
    )
    .await;

    let record = fix
        .orchestrator
        .start_session(request(fix.dir.path()))
        .await
        .unwrap();
    // No pending question, so the quiet session waits for ordinary input.
    let waiting =
        wait_for_status(&fix.orchestrator, &record.id, SessionStatus::WaitingForInput).await;
    assert!(waiting.pending_question.is_none());

    let resumed = fix
        .orchestrator
        .resume_session(&record.id, "also fix the logout button")
        .await
        .unwrap();
    assert_eq!(resumed.status, SessionStatus::Running);
    assert_eq!(
        fix.agent.inputs.lock().unwrap().as_slice(),
        ["also fix the logout button".to_string()]
    );

    let stopped = fix.orchestrator.stop_session(&record.id).await.unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);

    // The stopped record survives as history.
    let history = fix.sessions.list_for_project("proj").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, SessionStatus::Stopped);
}
