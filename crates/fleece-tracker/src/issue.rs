use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleece_core::lockfile::{acquire_lock, LockGuard};
use fleece_core::{current_unix_timestamp_ms, write_text_atomic};

const ISSUE_STATE_SCHEMA_VERSION: u32 = 1;
const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;
const DEFAULT_LOCK_STALE_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `IssueStatus` values.
pub enum IssueStatus {
    Open,
    InProgress,
    Review,
    Complete,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One tracked issue, including its PR link and label list.
pub struct Issue {
    pub id: String,
    pub project_id: String,
    pub issue_type: String,
    pub title: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub working_branch_id: Option<String>,
    #[serde(default)]
    pub linked_pr_number: Option<u64>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub updated_unix_ms: u64,
    #[serde(default)]
    pub revision: u64,
}

impl Issue {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        issue_type: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            issue_type: issue_type.into(),
            title: title.into(),
            status: IssueStatus::Open,
            working_branch_id: None,
            linked_pr_number: None,
            labels: Vec::new(),
            close_reason: None,
            updated_unix_ms: current_unix_timestamp_ms(),
            revision: 0,
        }
    }
}

#[async_trait]
/// Trait contract for `IssueStore` behavior.
pub trait IssueStore: Send + Sync {
    async fn get(&self, project_id: &str, issue_id: &str) -> Result<Option<Issue>>;

    /// Persists `issue` under optimistic concurrency: a revision that moved
    /// past the caller's copy fails, and the losing writer must re-read.
    async fn put(&self, issue: &mut Issue) -> Result<()>;

    async fn close(&self, project_id: &str, issue_id: &str, reason: Option<&str>) -> Result<bool>;

    async fn list_for_project(&self, project_id: &str) -> Result<Vec<Issue>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IssueStateFile {
    schema_version: u32,
    #[serde(default)]
    issues: BTreeMap<String, Issue>,
}

impl Default for IssueStateFile {
    fn default() -> Self {
        Self {
            schema_version: ISSUE_STATE_SCHEMA_VERSION,
            issues: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
/// JSON-state-file issue store with advisory locking.
pub struct FileIssueStore {
    path: PathBuf,
    lock_wait_ms: u64,
    lock_stale_ms: u64,
}

impl FileIssueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create issue store directory {}", parent.display())
                })?;
            }
        }
        Ok(Self {
            path,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            lock_stale_ms: DEFAULT_LOCK_STALE_MS,
        })
    }

    fn record_key(project_id: &str, issue_id: &str) -> String {
        format!("{project_id}/{issue_id}")
    }

    fn read_state(&self) -> Result<IssueStateFile> {
        if !self.path.exists() {
            return Ok(IssueStateFile::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read issue state {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(IssueStateFile::default());
        }
        let state: IssueStateFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse issue state {}", self.path.display()))?;
        if state.schema_version != ISSUE_STATE_SCHEMA_VERSION {
            bail!(
                "unsupported issue state schema version {} in {}",
                state.schema_version,
                self.path.display()
            );
        }
        Ok(state)
    }

    fn write_state(&self, state: &IssueStateFile) -> Result<()> {
        let serialized =
            serde_json::to_string_pretty(state).context("failed to serialize issue state")?;
        write_text_atomic(&self.path, &serialized)
    }

    fn acquire_lock(&self) -> Result<LockGuard> {
        let mut name = self
            .path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("issues")
            .to_string();
        name.push_str(".lock");
        acquire_lock(
            &self.path.with_file_name(name),
            Duration::from_millis(self.lock_wait_ms),
            Duration::from_millis(self.lock_stale_ms),
        )
    }
}

#[async_trait]
impl IssueStore for FileIssueStore {
    async fn get(&self, project_id: &str, issue_id: &str) -> Result<Option<Issue>> {
        let state = self.read_state()?;
        Ok(state
            .issues
            .get(&Self::record_key(project_id, issue_id))
            .cloned())
    }

    async fn put(&self, issue: &mut Issue) -> Result<()> {
        let _guard = self.acquire_lock()?;
        let mut state = self.read_state()?;
        let key = Self::record_key(&issue.project_id, &issue.id);
        if let Some(stored) = state.issues.get(&key) {
            if stored.revision != issue.revision {
                bail!(
                    "issue '{}' was updated concurrently (stored revision {}, ours {})",
                    issue.id,
                    stored.revision,
                    issue.revision
                );
            }
        }
        issue.revision = issue.revision.saturating_add(1);
        issue.updated_unix_ms = current_unix_timestamp_ms();
        state.issues.insert(key, issue.clone());
        self.write_state(&state)
    }

    async fn close(&self, project_id: &str, issue_id: &str, reason: Option<&str>) -> Result<bool> {
        let _guard = self.acquire_lock()?;
        let mut state = self.read_state()?;
        let key = Self::record_key(project_id, issue_id);
        let Some(issue) = state.issues.get_mut(&key) else {
            return Ok(false);
        };
        if issue.status == IssueStatus::Closed {
            return Ok(false);
        }
        issue.status = IssueStatus::Closed;
        issue.close_reason = reason.map(ToOwned::to_owned);
        issue.revision = issue.revision.saturating_add(1);
        issue.updated_unix_ms = current_unix_timestamp_ms();
        self.write_state(&state)?;
        Ok(true)
    }

    async fn list_for_project(&self, project_id: &str) -> Result<Vec<Issue>> {
        let state = self.read_state()?;
        Ok(state
            .issues
            .values()
            .filter(|issue| issue.project_id == project_id)
            .cloned()
            .collect())
    }
}
