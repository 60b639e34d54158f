//! Provisioning retry and subprocess provider tests.
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use fleece_core::RetryPolicy;
use fleece_session::AgentError;

use super::{
    provision_with_retry, EnvironmentHandle, EnvironmentProvider, EnvironmentSpec, HealthStatus,
    SubprocessEnvironmentProvider,
};

struct FlakyProvider {
    failures_before_success: u32,
    retryable: bool,
    calls: AtomicU32,
}

impl FlakyProvider {
    fn new(failures_before_success: u32, retryable: bool) -> Self {
        Self {
            failures_before_success,
            retryable,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentProvider for FlakyProvider {
    async fn start(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures_before_success {
            if self.retryable {
                return Err(AgentError::Startup {
                    session_id: Some(spec.session_id.clone()),
                    message: format!("simulated provisioning failure {call}"),
                });
            }
            return Err(AgentError::CliFailure {
                session_id: spec.session_id.clone(),
                exit_code: Some(1),
                stderr: "simulated hard failure".into(),
            });
        }
        Ok(EnvironmentHandle {
            id: format!("env-{call}"),
            name: format!("fleece-{}", spec.session_id),
        })
    }

    async fn stop(&self, _handle: &EnvironmentHandle) -> Result<(), AgentError> {
        Ok(())
    }

    async fn health_check(&self, _handle: &EnvironmentHandle) -> Result<HealthStatus, AgentError> {
        Ok(HealthStatus::Alive)
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

fn spec() -> EnvironmentSpec {
    EnvironmentSpec {
        session_id: "s-1".into(),
        branch: "bug/fix-login-button+X1".into(),
        ..EnvironmentSpec::default()
    }
}

#[tokio::test]
async fn third_attempt_succeeds_within_budget() {
    let provider = FlakyProvider::new(2, true);
    let (_tx, mut cancel) = watch::channel(false);

    let (result, attempts) =
        provision_with_retry(&provider, &spec(), &fast_policy(3), &mut cancel).await;
    let handle = result.expect("provision");

    assert_eq!(attempts, 3);
    assert_eq!(provider.calls(), 3);
    assert_eq!(handle.name, "fleece-s-1");
}

#[tokio::test]
async fn exhausted_attempts_surface_last_error() {
    let provider = FlakyProvider::new(10, true);
    let (_tx, mut cancel) = watch::channel(false);

    let (result, attempts) =
        provision_with_retry(&provider, &spec(), &fast_policy(3), &mut cancel).await;
    let error = result.expect_err("must exhaust");

    assert!(matches!(error, AgentError::Startup { .. }));
    assert_eq!(attempts, 3);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn non_retryable_error_aborts_immediately() {
    let provider = FlakyProvider::new(10, false);
    let (_tx, mut cancel) = watch::channel(false);

    let (result, attempts) =
        provision_with_retry(&provider, &spec(), &fast_policy(5), &mut cancel).await;
    let error = result.expect_err("must fail");

    assert!(!error.is_retryable());
    // The spent count reflects the single attempt, not the budget.
    assert_eq!(attempts, 1);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn stop_request_cancels_before_first_attempt() {
    let provider = FlakyProvider::new(0, true);
    let (tx, mut cancel) = watch::channel(false);
    tx.send(true).expect("signal stop");

    let (result, attempts) =
        provision_with_retry(&provider, &spec(), &fast_policy(3), &mut cancel).await;
    let error = result.expect_err("must cancel");

    assert!(matches!(error, AgentError::Startup { .. }));
    assert_eq!(attempts, 0);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn subprocess_provider_lifecycle_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider =
        SubprocessEnvironmentProvider::new("sh", vec!["-c".to_string(), "sleep 30".to_string()]);
    let spec = EnvironmentSpec {
        session_id: "s-1".into(),
        branch: "bug/fix+X1".into(),
        working_dir: temp.path().to_path_buf(),
        ..EnvironmentSpec::default()
    };

    let handle = provider.start(&spec).await.expect("start");
    assert_eq!(
        provider.health_check(&handle).await.expect("health"),
        HealthStatus::Alive
    );

    provider.stop(&handle).await.expect("stop");
    // A second stop on the already-gone environment is a no-op.
    provider.stop(&handle).await.expect("stop again");
    assert_eq!(
        provider.health_check(&handle).await.expect("health"),
        HealthStatus::Lost
    );
}

#[tokio::test]
async fn subprocess_provider_tracks_sessions_independently() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider =
        SubprocessEnvironmentProvider::new("sh", vec!["-c".to_string(), "sleep 30".to_string()]);
    let spec_for = |session_id: &str| EnvironmentSpec {
        session_id: session_id.into(),
        branch: "bug/fix+X1".into(),
        working_dir: temp.path().to_path_buf(),
        ..EnvironmentSpec::default()
    };

    let first = provider.start(&spec_for("s-1")).await.expect("start s-1");
    let second = provider.start(&spec_for("s-2")).await.expect("start s-2");
    assert_ne!(first.id, second.id);
    assert_eq!(second.name, "fleece-s-2");

    provider.stop(&first).await.expect("stop s-1");
    assert_eq!(
        provider.health_check(&first).await.expect("health s-1"),
        HealthStatus::Lost
    );
    assert_eq!(
        provider.health_check(&second).await.expect("health s-2"),
        HealthStatus::Alive
    );
    provider.stop(&second).await.expect("stop s-2");
}
