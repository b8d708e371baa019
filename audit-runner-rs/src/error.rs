//! Audit job errors
//!
//! Every variant is terminal for the job that raised it. Buffered callers see the
//! mapped HTTP status with a plain-text body; stream callers see the message in the
//! final `error` event.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Failed to start {program}: {source}")]
    LaunchError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Audit failed: {0}")]
    AuditFailed(String),

    #[error("Failed to deliver report: {0}")]
    DeliveryError(String),
}

impl AuditError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::LaunchError { .. } | Self::AuditFailed(_) | Self::DeliveryError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True when the error was raised before any process or artifact existed
    pub fn is_rejection(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl IntoResponse for AuditError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_rejection() {
            tracing::warn!(error = %self, "Audit request rejected");
        } else {
            tracing::error!(error = %self, "Audit request failed");
        }
        (status, self.to_string()).into_response()
    }
}
