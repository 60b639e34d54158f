//! Issue store, code-hosting client, and the PR↔issue linking engine.
//!
//! The linking engine keeps the issue tracker and the code-hosting pull
//! request in sync both ways: branch names carry the issue id, issues carry
//! the linked PR number plus a tracking label, and PR status changes map
//! onto issue status changes. Only open pull requests are tracked locally;
//! merged and closed ones are fetched from the remote on demand.

mod issue;
mod linker;
mod pull_request;
mod rest_client;

pub use issue::{FileIssueStore, Issue, IssueStatus, IssueStore};
pub use linker::{pr_tracking_label, PrIssueLinker};
pub use pull_request::{CodeHostClient, PullRequest, PullRequestStatus, RepoRef};
pub use rest_client::{RestCodeHostClient, RestCodeHostConfig};
