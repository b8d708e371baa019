use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::header::{HeaderMap, HOST},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub mod artifact;
pub mod config;
pub mod error;
pub mod job;
pub mod launcher;
pub mod relay;
pub mod validation;

pub use artifact::{Artifact, ArtifactAllocator, ArtifactGuard, OutputFormat};
pub use config::AuditRunnerConfig;
pub use error::{AuditError, AuditResult};
pub use job::{AuditRequest, Delivery, DeliveryMode, JobController};
pub use launcher::{AuditLauncher, AuditProcess, LauncherConfig};

use validation::API_KEY_HEADER;

/// Where `GET /` sends visitors
pub const README_URL: &str = "https://github.com/GoogleChrome/lighthouse#readme";

const MAX_BODY_SIZE: usize = 64 * 1024;

/// Body of `POST /ci`
#[derive(Debug, Deserialize)]
pub struct CiBody {
    #[serde(default, alias = "testUrl", alias = "targetUrl")]
    pub url: Option<String>,
    #[serde(default, alias = "output")]
    pub format: Option<String>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub headless: bool,
}

/// Query string shared by the GET audit routes
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    #[serde(default, alias = "testUrl", alias = "targetUrl")]
    pub url: Option<String>,
    #[serde(default, alias = "output")]
    pub format: Option<String>,
    #[serde(default)]
    pub headless: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub service_name: String,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Audit runner HTTP service state
pub struct AuditRunner {
    controller: JobController,
    public_base_url: Option<String>,
    started: Instant,
}

impl AuditRunner {
    pub fn new(config: AuditRunnerConfig) -> Self {
        let controller = JobController::new(
            ArtifactAllocator::new(config.artifact_dir),
            AuditLauncher::new(config.launcher),
            config.api_key,
        );
        Self {
            controller,
            public_base_url: config.public_base_url,
            started: Instant::now(),
        }
    }

    pub fn controller(&self) -> &JobController {
        &self.controller
    }

    /// Create the artifact directory before serving
    pub async fn prepare(&self) -> std::io::Result<()> {
        self.controller.allocator().prepare().await
    }

    /// Public origin for report links
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

    /// Create the Axum router with all routes and middleware
    pub fn create_router(self: Arc<Self>) -> Router {
        let reports = ServeDir::new(self.controller.allocator().published_dir());

        Router::new()
            .route("/", get(Self::root_handler))
            .route("/health", get(Self::health_handler))
            .route("/ci", get(Self::ci_query_handler).post(Self::ci_handler))
            .route("/stream", get(Self::stream_handler))
            .route("/log", get(Self::log_handler))
            .nest_service("/reports", reports)
            .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
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
            service_name: "audit-runner".to_string(),
            uptime_seconds: state.started.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn ci_handler(
        State(state): State<Arc<Self>>,
        headers: HeaderMap,
        Json(body): Json<CiBody>,
    ) -> Response {
        let request = AuditRequest {
            target_url: body.url,
            output_format: body.format,
            mode: if body.streaming {
                DeliveryMode::Stream
            } else {
                DeliveryMode::Report
            },
            api_key: api_key(&headers),
            headless: body.headless,
        };
        state.submit(request, &headers).await
    }

    async fn ci_query_handler(
        State(state): State<Arc<Self>>,
        headers: HeaderMap,
        Query(query): Query<AuditQuery>,
    ) -> Response {
        let request = query.into_request(DeliveryMode::Report, api_key(&headers));
        state.submit(request, &headers).await
    }

    async fn stream_handler(
        State(state): State<Arc<Self>>,
        headers: HeaderMap,
        Query(query): Query<AuditQuery>,
    ) -> Response {
        let request = query.into_request(DeliveryMode::Stream, None);
        state.submit(request, &headers).await
    }

    async fn log_handler(
        State(state): State<Arc<Self>>,
        headers: HeaderMap,
        Query(query): Query<AuditQuery>,
    ) -> Response {
        let request = query.into_request(DeliveryMode::Log, None);
        state.submit(request, &headers).await
    }

    async fn submit(&self, request: AuditRequest, headers: &HeaderMap) -> Response {
        let base_url = self.base_url(headers);
        match self.controller.run(request, &base_url).await {
            Ok(delivery) => delivery.into_response(),
            Err(e) => e.into_response(),
        }
    }
}

impl AuditQuery {
    fn into_request(self, mode: DeliveryMode, api_key: Option<String>) -> AuditRequest {
        AuditRequest {
            target_url: self.url,
            output_format: self.format,
            mode,
            api_key,
            headless: self.headless,
        }
    }
}

fn api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
