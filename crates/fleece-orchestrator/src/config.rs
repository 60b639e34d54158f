use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use fleece_core::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
/// Tunable policy for the orchestrator; every field has a default so a
/// partial TOML file works.
pub struct OrchestratorConfig {
    /// Retry budget and backoff for environment provisioning.
    pub provision: RetryPolicy,
    /// Quiet period after which a running session is reclassified as
    /// waiting for input or for a question answer.
    pub idle_window_ms: u64,
    /// Maximum time without progress before a session times out.
    pub max_session_duration_ms: u64,
    /// Cadence of environment health probes.
    pub health_check_interval_ms: u64,
    /// Base branch pull requests target.
    pub base_branch: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provision: RetryPolicy::default(),
            idle_window_ms: 30_000,
            max_session_duration_ms: 3_600_000,
            health_check_interval_ms: 10_000,
            base_branch: "main".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }
}
