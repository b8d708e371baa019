//! Commit status and pull request comment reporting

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{CiError, CiResult};

/// Status context shown on the pull request
pub const STATUS_CONTEXT: &str = "Lighthouse";

const USER_AGENT: &str = concat!("lighthouse-ci/", env!("CARGO_PKG_VERSION"));

/// Identifies the pull request being audited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrInfo {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub sha: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

/// One commit status update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitStatus {
    pub state: StatusState,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub context: String,
}

impl CommitStatus {
    pub fn new(state: StatusState, description: impl Into<String>) -> Self {
        Self {
            state,
            description: description.into(),
            target_url: None,
            context: STATUS_CONTEXT.to_string(),
        }
    }

    pub fn pending() -> Self {
        Self::new(StatusState::Pending, "Auditing PR changes...")
    }

    pub fn complete() -> Self {
        Self::new(StatusState::Success, "Auditing complete. See scores above.")
    }

    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }
}

/// Where audit progress gets reported
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn create_status(&self, pr: &PrInfo, status: &CommitStatus) -> CiResult<serde_json::Value>;

    async fn post_comment(&self, pr: &PrInfo, body: &str) -> CiResult<()>;

    /// Mark the commit as errored. Failures here are logged, never returned.
    async fn report_error(&self, pr: &PrInfo, err: &CiError) {
        error!(owner = %pr.owner, repo = %pr.repo, sha = %pr.sha, error = %err, "Lighthouse CI run failed");
        let status = CommitStatus::new(StatusState::Error, format!("Error. {}", err));
        if let Err(e) = self.create_status(pr, &status).await {
            error!(error = %e, "Failed to post error status");
        }
    }
}

/// GitHub REST API reporter
pub struct GithubReporter {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl GithubReporter {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            builder = builder.header(header::AUTHORIZATION, format!("token {}", token));
        }
        builder
    }

    async fn check(response: reqwest::Response) -> CiResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CiError::Upstream {
            service: "GitHub",
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl StatusReporter for GithubReporter {
    async fn create_status(&self, pr: &PrInfo, status: &CommitStatus) -> CiResult<serde_json::Value> {
        let url = format!(
            "{}/repos/{}/{}/statuses/{}",
            self.api_url, pr.owner, pr.repo, pr.sha
        );
        let response = Self::check(self.request(url).json(status).send().await?).await?;
        debug!(sha = %pr.sha, state = ?status.state, description = %status.description, "Commit status posted");
        Ok(response.json().await?)
    }

    async fn post_comment(&self, pr: &PrInfo, body: &str) -> CiResult<()> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.api_url, pr.owner, pr.repo, pr.number
        );
        Self::check(
            self.request(url)
                .json(&serde_json::json!({ "body": body }))
                .send()
                .await?,
        )
        .await?;
        debug!(number = pr.number, "Pull request comment posted");
        Ok(())
    }
}
