use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
/// `(owner, repo)` pair every code-hosting call is keyed by.
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `PullRequestStatus` values.
///
/// The open variants are the only ones tracked locally; `Merged` and
/// `Closed` are terminal and fetched from the remote on demand.
pub enum PullRequestStatus {
    InDevelopment,
    ReadyForReview,
    HasReviewComments,
    Approved,
    ChecksFailing,
    HasConflicts,
    Merged,
    Closed,
}

impl PullRequestStatus {
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Merged | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One pull request as seen through the code-hosting client.
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub source_branch: String,
    pub status: PullRequestStatus,
}

#[async_trait]
/// Trait contract for `CodeHostClient` behavior.
pub trait CodeHostClient: Send + Sync {
    async fn get_pull_request(&self, number: u64) -> Result<Option<PullRequest>>;

    async fn list_open_pull_requests(&self) -> Result<Vec<PullRequest>>;

    async fn create_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;

    async fn merge_pull_request(&self, number: u64) -> Result<bool>;

    /// Combines reviews, check-runs, and mergeability into one status.
    async fn pull_request_status(&self, number: u64) -> Result<PullRequestStatus>;
}
