//! Bidirectional PR↔issue association and status synchronization.

use std::sync::Arc;

use tracing::{debug, warn};

use fleece_vcs::parse_issue_id;

use crate::issue::{IssueStatus, IssueStore};
use crate::pull_request::{CodeHostClient, PullRequestStatus};

/// Tracking label encoding the linked PR number on the issue.
pub fn pr_tracking_label(pr_number: u64) -> String {
    format!("pr-{pr_number}")
}

/// Links pull requests to issues and maps PR status onto issue status.
///
/// Every operation returns a boolean rather than erroring on expected
/// outcomes: a non-matching branch, a missing link, or an issue already in
/// the target status are ordinary no-ops the caller can branch on.
pub struct PrIssueLinker {
    issues: Arc<dyn IssueStore>,
    host: Arc<dyn CodeHostClient>,
}

impl PrIssueLinker {
    pub fn new(issues: Arc<dyn IssueStore>, host: Arc<dyn CodeHostClient>) -> Self {
        Self { issues, host }
    }

    /// Sets the issue's linked-PR reference and adds the tracking label.
    ///
    /// Returns `false` when the issue is missing or the update fails, so the
    /// caller decides whether to retry.
    pub async fn link_by_label(&self, project_id: &str, issue_id: &str, pr_number: u64) -> bool {
        let issue = match self.issues.get(project_id, issue_id).await {
            Ok(Some(issue)) => issue,
            Ok(None) => {
                debug!(project_id, issue_id, "link_by_label: issue not found");
                return false;
            }
            Err(error) => {
                warn!(project_id, issue_id, "link_by_label: read failed: {error}");
                return false;
            }
        };

        let label = pr_tracking_label(pr_number);
        let mut updated = issue;
        if updated.linked_pr_number == Some(pr_number) && updated.labels.contains(&label) {
            return true;
        }
        updated.linked_pr_number = Some(pr_number);
        if !updated.labels.contains(&label) {
            updated.labels.push(label);
        }
        match self.issues.put(&mut updated).await {
            Ok(()) => true,
            Err(error) => {
                warn!(project_id, issue_id, "link_by_label: update failed: {error}");
                false
            }
        }
    }

    /// Resolves the issue a PR belongs to from its source branch name.
    ///
    /// `None` for a branch that does not match `{type}/{branch-id}+{issue-id}`
    /// or an issue id that does not exist; both are expected outcomes.
    pub async fn link_by_branch_name(&self, project_id: &str, pr_number: u64) -> Option<String> {
        let pull = match self.host.get_pull_request(pr_number).await {
            Ok(Some(pull)) => pull,
            Ok(None) => {
                debug!(pr_number, "link_by_branch_name: pull request not found");
                return None;
            }
            Err(error) => {
                warn!(pr_number, "link_by_branch_name: read failed: {error}");
                return None;
            }
        };

        let issue_id = parse_issue_id(&pull.source_branch)?.to_string();
        match self.issues.get(project_id, &issue_id).await {
            Ok(Some(_)) => {
                if !self.link_by_label(project_id, &issue_id, pr_number).await {
                    warn!(pr_number, issue_id, "link_by_branch_name: label update failed");
                }
                Some(issue_id)
            }
            Ok(None) => {
                debug!(
                    pr_number,
                    issue_id, "link_by_branch_name: branch names unknown issue"
                );
                None
            }
            Err(error) => {
                warn!(pr_number, issue_id, "link_by_branch_name: lookup failed: {error}");
                None
            }
        }
    }

    /// Closes the issue linked to `pr_number`, if any.
    pub async fn close_linked_issue(
        &self,
        project_id: &str,
        pr_number: u64,
        reason: Option<&str>,
    ) -> bool {
        let Some(issue_id) = self.find_linked_issue(project_id, pr_number).await else {
            return false;
        };
        match self.issues.close(project_id, &issue_id, reason).await {
            Ok(closed) => closed,
            Err(error) => {
                warn!(project_id, issue_id, "close_linked_issue failed: {error}");
                false
            }
        }
    }

    /// Maps a PR status onto the issue's status.
    ///
    /// Any open-PR status maps to `Review`, a merged PR to `Complete`, and a
    /// closed unmerged PR to `Closed`. Returns `false` without writing when
    /// the issue is already in the target status; a second identical call is
    /// always a no-op.
    pub async fn update_issue_status_from_pr(
        &self,
        project_id: &str,
        issue_id: &str,
        pr_status: PullRequestStatus,
        pr_number: u64,
    ) -> bool {
        let target = match pr_status {
            PullRequestStatus::Merged => IssueStatus::Complete,
            PullRequestStatus::Closed => IssueStatus::Closed,
            _open => IssueStatus::Review,
        };

        let issue = match self.issues.get(project_id, issue_id).await {
            Ok(Some(issue)) => issue,
            Ok(None) => {
                debug!(project_id, issue_id, "status update: issue not found");
                return false;
            }
            Err(error) => {
                warn!(project_id, issue_id, "status update: read failed: {error}");
                return false;
            }
        };

        if issue.status == target {
            return false;
        }

        let mut updated = issue;
        updated.status = target;
        if updated.linked_pr_number.is_none() {
            updated.linked_pr_number = Some(pr_number);
        }
        match self.issues.put(&mut updated).await {
            Ok(()) => true,
            Err(error) => {
                warn!(project_id, issue_id, "status update: write failed: {error}");
                false
            }
        }
    }

    async fn find_linked_issue(&self, project_id: &str, pr_number: u64) -> Option<String> {
        let issues = match self.issues.list_for_project(project_id).await {
            Ok(issues) => issues,
            Err(error) => {
                warn!(project_id, pr_number, "linked-issue scan failed: {error}");
                return None;
            }
        };
        issues
            .into_iter()
            .find(|issue| issue.linked_pr_number == Some(pr_number))
            .map(|issue| issue.id)
    }
}
