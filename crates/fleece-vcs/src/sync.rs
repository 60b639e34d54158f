//! Git synchronization for the tracked fleece state inside a worktree.
//!
//! Every operation reports a structured result. Divergence from upstream and
//! local edits outside the fleece path domain are surfaced to the caller and
//! never auto-resolved or merged over.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
/// Remote, tracked-path domain, and timeout knobs for git operations.
pub struct GitSyncConfig {
    pub remote: String,
    /// Path prefixes that make up the fleece-tracked domain. An empty list
    /// means every path in the worktree is tracked.
    pub tracked_prefixes: Vec<String>,
    pub command_timeout_ms: u64,
}

impl Default for GitSyncConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            tracked_prefixes: Vec::new(),
            command_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Outcome of committing and pushing tracked state.
pub struct CommitSyncResult {
    pub success: bool,
    pub message: String,
    pub committed_files: Vec<String>,
    pub pushed: bool,
    pub requires_pull_first: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Outcome of pulling tracked state from the remote.
pub struct PullSyncResult {
    pub success: bool,
    pub message: String,
    pub was_behind_remote: bool,
    pub requires_pull_first: bool,
    pub has_non_fleece_changes: bool,
    pub non_fleece_changed_files: Vec<String>,
    pub updated_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Snapshot of a worktree branch relative to its upstream.
pub struct BranchStatus {
    pub branch: String,
    pub ahead: u64,
    pub behind: u64,
    pub has_local_changes: bool,
    pub changed_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The worktree is on a different branch than the session expects.
pub struct BranchMismatch {
    pub current: String,
    pub expected: String,
}

impl std::fmt::Display for BranchMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "worktree is on branch '{}' but session expects '{}'",
            self.current, self.expected
        )
    }
}

#[derive(Debug, Clone)]
/// Git-CLI-backed sync engine for session worktrees.
pub struct GitSync {
    config: GitSyncConfig,
}

struct GitOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn ok(&self) -> bool {
        self.code == Some(0)
    }
}

impl GitSync {
    pub fn new(config: GitSyncConfig) -> Self {
        Self { config }
    }

    /// Stages and commits changes inside the tracked domain, then pushes.
    ///
    /// A push rejected as non-fast-forward reports `requires_pull_first`
    /// with `pushed = false`; the engine never force-pushes.
    pub async fn commit_and_push(&self, dir: &Path, message: &str) -> Result<CommitSyncResult> {
        let changed = self.changed_paths(dir).await?;
        let (tracked, _) = self.split_tracked(&changed);
        if tracked.is_empty() {
            return Ok(CommitSyncResult {
                success: true,
                message: "no tracked changes to commit".to_string(),
                ..CommitSyncResult::default()
            });
        }

        let mut add_args = vec!["add", "--"];
        if self.config.tracked_prefixes.is_empty() {
            add_args.push(".");
        } else {
            for prefix in &self.config.tracked_prefixes {
                add_args.push(prefix.as_str());
            }
        }
        let add = self.run_git(dir, &add_args).await?;
        if !add.ok() {
            return Ok(CommitSyncResult {
                success: false,
                message: format!("git add failed: {}", add.stderr.trim()),
                ..CommitSyncResult::default()
            });
        }

        let commit = self.run_git(dir, &["commit", "-m", message]).await?;
        if !commit.ok() {
            return Ok(CommitSyncResult {
                success: false,
                message: format!("git commit failed: {}", commit.stderr.trim()),
                ..CommitSyncResult::default()
            });
        }

        let push = self.run_git(dir, &["push", self.config.remote.as_str()]).await?;
        if push.ok() {
            return Ok(CommitSyncResult {
                success: true,
                message: format!("committed {} file(s) and pushed", tracked.len()),
                committed_files: tracked,
                pushed: true,
                requires_pull_first: false,
            });
        }

        let rejected = push.stderr.contains("non-fast-forward")
            || push.stderr.contains("fetch first")
            || push.stderr.contains("[rejected]");
        Ok(CommitSyncResult {
            success: false,
            message: if rejected {
                "push rejected: remote has newer commits, pull first".to_string()
            } else {
                format!("git push failed: {}", push.stderr.trim())
            },
            committed_files: tracked,
            pushed: false,
            requires_pull_first: rejected,
        })
    }

    /// Fetches and fast-forwards tracked state from the remote.
    ///
    /// Local edits outside the tracked domain block the pull and are listed
    /// in the result; diverged histories block the pull and report
    /// `requires_pull_first`. Neither case performs any destructive action.
    pub async fn pull_tracked(&self, dir: &Path) -> Result<PullSyncResult> {
        let changed = self.changed_paths(dir).await?;
        let (_, non_fleece) = self.split_tracked(&changed);
        if !non_fleece.is_empty() {
            return Ok(PullSyncResult {
                success: false,
                message: "pull blocked: local changes outside the tracked domain".to_string(),
                has_non_fleece_changes: true,
                non_fleece_changed_files: non_fleece,
                ..PullSyncResult::default()
            });
        }

        let fetch = self
            .run_git(dir, &["fetch", self.config.remote.as_str()])
            .await?;
        if !fetch.ok() {
            return Ok(PullSyncResult {
                success: false,
                message: format!("git fetch failed: {}", fetch.stderr.trim()),
                ..PullSyncResult::default()
            });
        }

        let (ahead, behind) = self.ahead_behind(dir).await?;
        if behind == 0 {
            return Ok(PullSyncResult {
                success: true,
                message: "already up to date".to_string(),
                ..PullSyncResult::default()
            });
        }
        if ahead > 0 {
            return Ok(PullSyncResult {
                success: false,
                message: format!(
                    "branch diverged from upstream ({ahead} ahead, {behind} behind); resolve before pulling"
                ),
                was_behind_remote: true,
                requires_pull_first: true,
                ..PullSyncResult::default()
            });
        }

        let before = self.head_commit(dir).await?;
        let merge = self.run_git(dir, &["merge", "--ff-only", "@{u}"]).await?;
        if !merge.ok() {
            return Ok(PullSyncResult {
                success: false,
                message: format!("fast-forward failed: {}", merge.stderr.trim()),
                was_behind_remote: true,
                requires_pull_first: true,
                ..PullSyncResult::default()
            });
        }
        let after = self.head_commit(dir).await?;
        let diff = self
            .run_git(dir, &["diff", "--name-only", &format!("{before}..{after}")])
            .await?;
        let updated_files = diff
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();
        Ok(PullSyncResult {
            success: true,
            message: format!("fast-forwarded {behind} commit(s)"),
            was_behind_remote: true,
            updated_files,
            ..PullSyncResult::default()
        })
    }

    /// Reports the current branch, ahead/behind counts, and dirty files.
    pub async fn branch_status(&self, dir: &Path) -> Result<BranchStatus> {
        let branch = self.current_branch(dir).await?;
        let (ahead, behind) = self.ahead_behind(dir).await?;
        let changed_files = self.changed_paths(dir).await?;
        Ok(BranchStatus {
            branch,
            ahead,
            behind,
            has_local_changes: !changed_files.is_empty(),
            changed_files,
        })
    }

    /// Compares the worktree's branch against the freshly regenerated
    /// expected name. `None` means the branches match.
    pub async fn verify_branch(&self, dir: &Path, expected: &str) -> Result<Option<BranchMismatch>> {
        let current = self.current_branch(dir).await?;
        if current == expected {
            Ok(None)
        } else {
            Ok(Some(BranchMismatch {
                current,
                expected: expected.to_string(),
            }))
        }
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String> {
        let output = self
            .run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        if !output.ok() {
            bail!("failed to resolve current branch: {}", output.stderr.trim());
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn head_commit(&self, dir: &Path) -> Result<String> {
        let output = self.run_git(dir, &["rev-parse", "HEAD"]).await?;
        if !output.ok() {
            bail!("failed to resolve HEAD: {}", output.stderr.trim());
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn ahead_behind(&self, dir: &Path) -> Result<(u64, u64)> {
        let output = self
            .run_git(dir, &["rev-list", "--left-right", "--count", "HEAD...@{u}"])
            .await?;
        if !output.ok() {
            // No upstream configured counts as neither ahead nor behind.
            return Ok((0, 0));
        }
        let mut parts = output.stdout.split_whitespace();
        let ahead = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let behind = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok((ahead, behind))
    }

    async fn changed_paths(&self, dir: &Path) -> Result<Vec<String>> {
        let output = self.run_git(dir, &["status", "--porcelain"]).await?;
        if !output.ok() {
            bail!("git status failed: {}", output.stderr.trim());
        }
        Ok(output
            .stdout
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| line[3..].trim().to_string())
            .filter(|path| !path.is_empty())
            .collect())
    }

    fn split_tracked(&self, paths: &[String]) -> (Vec<String>, Vec<String>) {
        if self.config.tracked_prefixes.is_empty() {
            return (paths.to_vec(), Vec::new());
        }
        let mut tracked = Vec::new();
        let mut other = Vec::new();
        for path in paths {
            let inside = self
                .config
                .tracked_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()));
            if inside {
                tracked.push(path.clone());
            } else {
                other.push(path.clone());
            }
        }
        (tracked, other)
    }

    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let timeout = Duration::from_millis(self.config.command_timeout_ms.max(1));
        let child = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();
        let output = tokio::time::timeout(timeout, child)
            .await
            .with_context(|| format!("git {} timed out in {}", args.join(" "), dir.display()))?
            .with_context(|| format!("failed to run git {} in {}", args.join(" "), dir.display()))?;
        let result = GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.ok() {
            debug!(
                command = %format!("git {}", args.join(" ")),
                code = ?result.code,
                "git command failed: {}",
                result.stderr.trim()
            );
        }
        Ok(result)
    }
}
