//! GitHub-shaped REST implementation of the code-hosting client.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::pull_request::{CodeHostClient, PullRequest, PullRequestStatus, RepoRef};

#[derive(Debug, Clone)]
/// Connection and retry knobs for the REST client.
pub struct RestCodeHostConfig {
    pub api_base: String,
    pub token: String,
    pub repo: RepoRef,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

#[derive(Clone)]
/// REST code-hosting client with bounded retry on transient failures.
pub struct RestCodeHostClient {
    http: reqwest::Client,
    api_base: String,
    repo: RepoRef,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct WireBranchRef {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WirePullRequest {
    number: u64,
    html_url: String,
    state: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    mergeable: Option<bool>,
    head: WireBranchRef,
}

#[derive(Debug, Clone, Deserialize)]
struct WireReview {
    #[serde(default)]
    state: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireCombinedStatus {
    #[serde(default)]
    state: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireMergeResult {
    #[serde(default)]
    merged: bool,
}

impl RestCodeHostClient {
    pub fn new(config: RestCodeHostConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("fleece-orchestrator"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            reqwest::header::HeaderValue::from_static("2022-11-28"),
        );
        let auth_header = format!("Bearer {}", config.token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_header)
                .context("invalid code-host authorization header")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create code-host http client")?;
        Ok(Self {
            http: client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            repo: config.repo,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms.max(1),
        })
    }

    fn pulls_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}/pulls{suffix}",
            self.api_base, self.repo.owner, self.repo.name
        )
    }

    async fn request_json<T, F>(&self, operation: &str, mut request_builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder().send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed = response.json::<T>().await.with_context(|| {
                            format!("failed to decode code-host {operation}")
                        })?;
                        return Ok(parsed);
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts && is_retryable_status(status.as_u16()) {
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "code-host {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("code-host {operation} request failed"));
                }
            }
        }
    }

    async fn fetch_pull_detail(&self, number: u64) -> Result<Option<WirePullRequest>> {
        let url = self.pulls_url(&format!("/{number}"));
        let result: Result<WirePullRequest> = self
            .request_json("read pull request", || self.http.get(url.clone()))
            .await;
        match result {
            Ok(wire) => Ok(Some(wire)),
            Err(error) if error.to_string().contains("status 404") => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn derive_status(&self, wire: &WirePullRequest) -> Result<PullRequestStatus> {
        if wire.merged {
            return Ok(PullRequestStatus::Merged);
        }
        if wire.state == "closed" {
            return Ok(PullRequestStatus::Closed);
        }
        if wire.mergeable == Some(false) {
            return Ok(PullRequestStatus::HasConflicts);
        }

        let combined: WireCombinedStatus = self
            .request_json("read combined status", || {
                self.http.get(format!(
                    "{}/repos/{}/{}/commits/{}/status",
                    self.api_base, self.repo.owner, self.repo.name, wire.head.sha
                ))
            })
            .await?;
        if combined.state == "failure" || combined.state == "error" {
            return Ok(PullRequestStatus::ChecksFailing);
        }

        let reviews: Vec<WireReview> = self
            .request_json("read pull request reviews", || {
                self.http
                    .get(self.pulls_url(&format!("/{}/reviews", wire.number)))
            })
            .await?;
        if reviews
            .iter()
            .any(|review| review.state == "CHANGES_REQUESTED")
        {
            return Ok(PullRequestStatus::HasReviewComments);
        }
        if reviews.iter().any(|review| review.state == "APPROVED") {
            return Ok(PullRequestStatus::Approved);
        }
        if wire.draft {
            return Ok(PullRequestStatus::InDevelopment);
        }
        Ok(PullRequestStatus::ReadyForReview)
    }

    fn to_model(wire: &WirePullRequest, status: PullRequestStatus) -> PullRequest {
        PullRequest {
            number: wire.number,
            url: wire.html_url.clone(),
            source_branch: wire.head.branch.clone(),
            status,
        }
    }
}

#[async_trait]
impl CodeHostClient for RestCodeHostClient {
    async fn get_pull_request(&self, number: u64) -> Result<Option<PullRequest>> {
        let Some(wire) = self.fetch_pull_detail(number).await? else {
            return Ok(None);
        };
        let status = self.derive_status(&wire).await?;
        Ok(Some(Self::to_model(&wire, status)))
    }

    async fn list_open_pull_requests(&self) -> Result<Vec<PullRequest>> {
        let rows: Vec<WirePullRequest> = self
            .request_json("list open pull requests", || {
                self.http
                    .get(self.pulls_url(""))
                    .query(&[("state", "open"), ("per_page", "100")])
            })
            .await?;
        Ok(rows
            .iter()
            .map(|wire| {
                let status = if wire.draft {
                    PullRequestStatus::InDevelopment
                } else {
                    PullRequestStatus::ReadyForReview
                };
                Self::to_model(wire, status)
            })
            .collect())
    }

    async fn create_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let payload = json!({
            "head": head,
            "base": base,
            "title": title,
            "body": body,
        });
        let wire: WirePullRequest = self
            .request_json("create pull request", || {
                self.http.post(self.pulls_url("")).json(&payload)
            })
            .await?;
        Ok(Self::to_model(&wire, PullRequestStatus::InDevelopment))
    }

    async fn merge_pull_request(&self, number: u64) -> Result<bool> {
        let result: WireMergeResult = self
            .request_json("merge pull request", || {
                self.http
                    .put(self.pulls_url(&format!("/{number}/merge")))
                    .json(&json!({}))
            })
            .await?;
        Ok(result.merged)
    }

    async fn pull_request_status(&self, number: u64) -> Result<PullRequestStatus> {
        let Some(wire) = self.fetch_pull_detail(number).await? else {
            bail!("pull request {number} does not exist");
        };
        self.derive_status(&wire).await
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn retry_delay(base_delay_ms: u64, attempt: usize, retry_after: Option<Duration>) -> Duration {
    if let Some(retry_after) = retry_after {
        return retry_after;
    }
    let exponent = attempt.saturating_sub(1).min(8) as u32;
    Duration::from_millis(base_delay_ms.saturating_mul(1_u64 << exponent))
}

fn truncate_for_error(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
