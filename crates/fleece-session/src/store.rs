//! Durable session persistence with advisory locking and optimistic writes.
//!
//! One JSON state file holds every session record for a store root. Writers
//! take a sibling lock file around each read-modify-write, and each record
//! carries a revision that must match the stored one for a save to land;
//! a losing writer re-reads and retries. Reads never take the lock.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use fleece_core::lockfile::{acquire_lock, LockGuard};
use fleece_core::write_text_atomic;

use crate::error::AgentError;
use crate::record::SessionRecord;

const SESSION_STATE_SCHEMA_VERSION: u32 = 1;
const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;
const DEFAULT_LOCK_STALE_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionStateFile {
    schema_version: u32,
    #[serde(default)]
    sessions: BTreeMap<String, SessionRecord>,
}

impl Default for SessionStateFile {
    fn default() -> Self {
        Self {
            schema_version: SESSION_STATE_SCHEMA_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
/// File-backed store for session records.
pub struct SessionStore {
    path: PathBuf,
    lock_wait_ms: u64,
    lock_stale_ms: u64,
}

impl SessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create session store directory {}", parent.display())
                })?;
            }
        }
        Ok(Self {
            path,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            lock_stale_ms: DEFAULT_LOCK_STALE_MS,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let state = self.read_state()?;
        Ok(state.sessions.get(session_id).cloned())
    }

    pub fn list_for_project(&self, project_id: &str) -> Result<Vec<SessionRecord>> {
        let state = self.read_state()?;
        Ok(state
            .sessions
            .values()
            .filter(|record| record.project_id == project_id)
            .cloned()
            .collect())
    }

    /// Persists `record`, enforcing the optimistic revision check.
    ///
    /// On success the record's revision is bumped in place. A stored
    /// revision that moved past the caller's copy yields
    /// `AgentError::Conflict`; the caller re-reads and retries.
    pub fn save(&self, record: &mut SessionRecord) -> Result<(), AgentError> {
        let _guard = self
            .acquire_lock()
            .map_err(|error| AgentError::Store {
                message: error.to_string(),
            })?;
        let mut state = self.read_state().map_err(|error| AgentError::Store {
            message: error.to_string(),
        })?;

        if let Some(stored) = state.sessions.get(&record.id) {
            if stored.revision != record.revision {
                return Err(AgentError::Conflict {
                    message: format!(
                        "session '{}' was updated concurrently (stored revision {}, ours {})",
                        record.id, stored.revision, record.revision
                    ),
                });
            }
        }

        record.revision = record.revision.saturating_add(1);
        state.sessions.insert(record.id.clone(), record.clone());
        self.write_state(&state).map_err(|error| AgentError::Store {
            message: error.to_string(),
        })
    }

    fn read_state(&self) -> Result<SessionStateFile> {
        if !self.path.exists() {
            return Ok(SessionStateFile::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read session state {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(SessionStateFile::default());
        }
        let state: SessionStateFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse session state {}", self.path.display()))?;
        if state.schema_version != SESSION_STATE_SCHEMA_VERSION {
            bail!(
                "unsupported session state schema version {} in {}",
                state.schema_version,
                self.path.display()
            );
        }
        Ok(state)
    }

    fn write_state(&self, state: &SessionStateFile) -> Result<()> {
        let serialized =
            serde_json::to_string_pretty(state).context("failed to serialize session state")?;
        write_text_atomic(&self.path, &serialized)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("sessions")
            .to_string();
        name.push_str(".lock");
        self.path.with_file_name(name)
    }

    fn acquire_lock(&self) -> Result<LockGuard> {
        acquire_lock(
            &self.lock_path(),
            Duration::from_millis(self.lock_wait_ms),
            Duration::from_millis(self.lock_stale_ms),
        )
    }
}
