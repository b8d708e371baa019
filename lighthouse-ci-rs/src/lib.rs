use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::header::{HeaderMap, HOST},
    response::{IntoResponse, Redirect},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod builder;
pub mod config;
pub mod error;
pub mod github;
pub mod pending;
pub mod scores;
pub mod webpagetest;

pub use builder::BuilderClient;
pub use config::CiConfig;
pub use error::{CiError, CiResult};
pub use github::{CommitStatus, GithubReporter, PrInfo, StatusReporter, StatusState};
pub use pending::{PendingRun, PendingRuns};
pub use webpagetest::{RemoteTestService, TestStart, WebPageTest};

use scores::{comment_body, evaluate, LighthouseReport};

pub const README_URL: &str = "https://github.com/GoogleChrome/lighthouse#readme";

const API_KEY_HEADER: &str = "x-api-key";

/// Per-run options sent by the CI client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Minimum score per category id; empty means report scores without pass/fail
    #[serde(default)]
    pub thresholds: BTreeMap<String, u32>,
    #[serde(default)]
    pub add_comment: bool,
    #[serde(default)]
    pub pingback_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRef {
    pub number: u64,
    pub sha: String,
}

/// Body of `/run_on_chrome` and `/run_on_wpt`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub test_url: Option<String>,
    pub repo: RepoRef,
    pub pr: PullRef,
    #[serde(flatten)]
    pub config: RunConfig,
}

impl RunRequest {
    pub fn pr_info(&self) -> PrInfo {
        PrInfo {
            owner: self.repo.owner.clone(),
            repo: self.repo.name.clone(),
            number: self.pr.number,
            sha: self.pr.sha.clone(),
        }
    }

    fn test_url(&self) -> CiResult<&str> {
        self.test_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| CiError::InvalidRequest("testUrl is required".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct PingQuery {
    pub id: Option<String>,
}

/// Scores returned to the CI client
#[derive(Debug, Serialize)]
pub struct ScoreResponse {
    pub score: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub service_name: String,
    pub uptime_seconds: u64,
    pub pending_runs: usize,
}

/// Lighthouse CI service state
pub struct CiService {
    reporter: Arc<dyn StatusReporter>,
    remote: Arc<dyn RemoteTestService>,
    builder: BuilderClient,
    pending: PendingRuns,
    builder_api_key: Option<String>,
    public_base_url: Option<String>,
    started: Instant,
}

impl CiService {
    pub fn new(config: &CiConfig) -> Self {
        Self::with_parts(
            Arc::new(GithubReporter::new(&config.github_api_url, config.oauth_token.clone())),
            Arc::new(WebPageTest::new(
                &config.wpt_api_url,
                config.wpt_api_key.clone(),
                &config.wpt_location,
            )),
            config,
        )
    }

    /// Build with explicit collaborators
    pub fn with_parts(
        reporter: Arc<dyn StatusReporter>,
        remote: Arc<dyn RemoteTestService>,
        config: &CiConfig,
    ) -> Self {
        Self {
            reporter,
            remote,
            builder: BuilderClient::new(&config.builder_url),
            pending: PendingRuns::new(),
            builder_api_key: config.lighthouse_api_key.clone(),
            public_base_url: config.public_base_url.clone(),
            started: Instant::now(),
        }
    }

    pub fn pending(&self) -> &PendingRuns {
        &self.pending
    }

    pub fn create_router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(Self::root_handler))
            .route("/health", get(Self::health_handler))
            .route("/run_on_chrome", post(Self::run_on_chrome_handler))
            .route("/run_on_wpt", post(Self::run_on_wpt_handler))
            .route("/wpt_ping", get(Self::wpt_ping_handler))
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    async fn root_handler() -> Redirect {
        Redirect::temporary(README_URL)
    }

    async fn health_handler(State(state): State<Arc<Self>>) -> impl IntoResponse {
        Json(HealthResponse {
            healthy: true,
            service_name: "lighthouse-ci".to_string(),
            uptime_seconds: state.started.elapsed().as_secs(),
            pending_runs: state.pending.len().await,
        })
    }

    /// Audit on headless Chrome through the audit runner, then report
    async fn run_on_chrome_handler(
        State(state): State<Arc<Self>>,
        headers: HeaderMap,
        Json(request): Json<RunRequest>,
    ) -> CiResult<Json<ScoreResponse>> {
        let pr = request.pr_info();
        let test_url = request.test_url()?;

        if let Err(e) = state.reporter.create_status(&pr, &CommitStatus::pending()).await {
            state.reporter.report_error(&pr, &e).await;
        }

        let api_key = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .or(state.builder_api_key.as_deref());

        let report = match state
            .builder
            .run(test_url, api_key)
            .await
            .and_then(LighthouseReport::from_value)
        {
            Ok(report) => report,
            Err(e) => {
                state.reporter.report_error(&pr, &e).await;
                return Err(e);
            }
        };

        info!(url = %test_url, sha = %pr.sha, "Headless Chrome audit finished");
        let response = state
            .publish(&pr, &request.config, &report, Some(test_url.to_string()))
            .await;
        Ok(Json(response))
    }

    /// Start a WebPageTest run; results arrive later through `/wpt_ping`
    async fn run_on_wpt_handler(
        State(state): State<Arc<Self>>,
        headers: HeaderMap,
        Json(request): Json<RunRequest>,
    ) -> CiResult<Json<serde_json::Value>> {
        let pr = request.pr_info();
        let test_url = request.test_url()?;
        let pingback = request
            .config
            .pingback_url
            .clone()
            .unwrap_or_else(|| format!("{}/wpt_ping", state.base_url(&headers)));

        let started = match state.remote.start(test_url, &pingback).await {
            Ok(started) => started,
            Err(e) => {
                state.reporter.report_error(&pr, &e).await;
                return Err(e);
            }
        };

        state
            .pending
            .insert(
                started.test_id.clone(),
                PendingRun {
                    pr: pr.clone(),
                    config: request.config.clone(),
                },
            )
            .await;

        let status = CommitStatus::pending().with_target_url(started.user_url.clone());
        match state.reporter.create_status(&pr, &status).await {
            Ok(created) => Ok(Json(created)),
            Err(e) => {
                state.reporter.report_error(&pr, &e).await;
                Err(e)
            }
        }
    }

    /// Pingback from WebPageTest once a run finished.
    ///
    /// The id is claimed before anything else, so a run is reported at most once and
    /// is forgotten on failure as well as on success.
    async fn wpt_ping_handler(
        State(state): State<Arc<Self>>,
        Query(query): Query<PingQuery>,
    ) -> CiResult<Json<ScoreResponse>> {
        let test_id = query.id.unwrap_or_default();
        let Some(run) = state.pending.remove(&test_id).await else {
            return Err(CiError::UnknownTest(test_id));
        };

        let report = match state
            .remote
            .results(&test_id)
            .await
            .and_then(LighthouseReport::from_value)
        {
            Ok(report) => report,
            Err(e) => {
                warn!(test_id = %test_id, error = %e, "WebPageTest results unusable, dropping run");
                state.reporter.report_error(&run.pr, &e).await;
                return Err(e);
            }
        };

        let target_url = state.remote.report_page(&test_id);
        let response = state
            .publish(&run.pr, &run.config, &report, Some(target_url))
            .await;

        info!(test_id = %test_id, sha = %run.pr.sha, "WebPageTest run reported");
        Ok(Json(response))
    }

    /// Post the final status and optional comment for a finished audit
    async fn publish(
        &self,
        pr: &PrInfo,
        config: &RunConfig,
        report: &LighthouseReport,
        target_url: Option<String>,
    ) -> ScoreResponse {
        let scores = report.scores();

        let mut status = if config.thresholds.is_empty() {
            CommitStatus::complete()
        } else {
            let evaluation = evaluate(&scores, &config.thresholds);
            let state = if evaluation.passing {
                StatusState::Success
            } else {
                StatusState::Failure
            };
            CommitStatus::new(state, evaluation.description)
        };
        status.target_url = target_url;

        if let Err(e) = self.reporter.create_status(pr, &status).await {
            self.reporter.report_error(pr, &e).await;
        }

        let mut warning = None;
        if config.add_comment {
            let body = comment_body(report, &config.thresholds);
            if let Err(e) = self.reporter.post_comment(pr, &body).await {
                warn!(number = pr.number, error = %e, "Failed to post Lighthouse comment");
                warning = Some("Error posting Lighthouse comment to PR.".to_string());
            }
        }

        ScoreResponse {
            score: scores,
            warning,
        }
    }

    fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(base) = &self.public_base_url {
            return base.clone();
        }
        let host = headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{}", host)
    }
}
