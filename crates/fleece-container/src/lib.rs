//! Execution-environment lifecycle: start, health-check, and teardown of the
//! isolated sandbox one session runs in.
//!
//! Providers are injected behind `EnvironmentProvider`; the bundled
//! implementation runs the agent CLI as a subprocess inside the session's
//! git worktree. Git identity and credential material is scoped to the
//! environment's own process env so two environments can never race on a
//! shared credential file.

mod provider;
mod provision;
mod subprocess;
#[cfg(test)]
mod tests;

pub use provider::{EnvironmentHandle, EnvironmentProvider, EnvironmentSpec, HealthStatus};
pub use provision::provision_with_retry;
pub use subprocess::SubprocessEnvironmentProvider;
