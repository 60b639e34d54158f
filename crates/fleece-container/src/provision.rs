use tokio::sync::watch;
use tracing::warn;

use fleece_core::RetryPolicy;
use fleece_session::AgentError;

use crate::provider::{EnvironmentHandle, EnvironmentProvider, EnvironmentSpec};

/// Provisions an environment with bounded retries and backoff.
///
/// Only errors whose `is_retryable()` is true are retried. The `cancel`
/// channel is the session's stop signal: it is observed before every attempt
/// and across every backoff sleep, so a stop request unwinds promptly
/// instead of letting a doomed session keep provisioning.
///
/// Returns the outcome together with the number of attempts spent, on the
/// error path too; a cancellation before the first attempt reports zero.
pub async fn provision_with_retry(
    provider: &dyn EnvironmentProvider,
    spec: &EnvironmentSpec,
    policy: &RetryPolicy,
    cancel: &mut watch::Receiver<bool>,
) -> (Result<EnvironmentHandle, AgentError>, u32) {
    let mut attempt = 0_u32;
    loop {
        if *cancel.borrow() {
            return (Err(cancelled(spec)), attempt);
        }
        attempt = attempt.saturating_add(1);
        match provider.start(spec).await {
            Ok(handle) => return (Ok(handle), attempt),
            Err(error) => {
                if !error.is_retryable() || policy.attempts_exhausted(attempt) {
                    return (Err(error), attempt);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    session_id = %spec.session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "environment provisioning failed, backing off: {error}"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return (Err(cancelled(spec)), attempt);
                        }
                    }
                }
            }
        }
    }
}

fn cancelled(spec: &EnvironmentSpec) -> AgentError {
    AgentError::Startup {
        session_id: Some(spec.session_id.clone()),
        message: "provisioning cancelled by stop request".to_string(),
    }
}
