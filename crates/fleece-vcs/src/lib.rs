//! Branch naming and git synchronization for Fleece worktrees.
//!
//! Branch names are regenerated from issue state immediately before any
//! branch or worktree is created; they are never cached because issue title
//! and type may change up to that point. Sync operations shell out to the
//! `git` CLI and report structured results instead of raising on expected
//! conditions like divergence or untracked local edits.

mod branch;
mod sync;

pub use branch::{generate_branch_name, parse_issue_id, worktree_dir_name};
pub use sync::{
    BranchMismatch, BranchStatus, CommitSyncResult, GitSync, GitSyncConfig, PullSyncResult,
};
