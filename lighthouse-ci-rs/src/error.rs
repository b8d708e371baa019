//! Error types for the CI service

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type CiResult<T> = Result<T, CiError>;

#[derive(Debug, Error)]
pub enum CiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown WebPageTest id.")]
    UnknownTest(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} responded with {status}: {body}")]
    Upstream {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Lighthouse results were not found in {0} results.")]
    MissingResults(&'static str),

    #[error("Malformed Lighthouse report: {0}")]
    MalformedReport(String),
}

impl CiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownTest(_) => StatusCode::NOT_FOUND,
            Self::Http(_) | Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::MissingResults(_) | Self::MalformedReport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::UnknownTest(id) => {
                tracing::warn!(test_id = %id, "Pingback for unknown WebPageTest id");
                return (status, self.to_string()).into_response();
            }
            _ if status.is_server_error() => tracing::error!(error = %self, "CI request failed"),
            _ => tracing::warn!(error = %self, "CI request rejected"),
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.to_string(),
                "code": status.as_u16(),
            })),
        )
            .into_response()
    }
}
