//! Request validation
//!
//! Runs synchronously before any artifact path is allocated or process started,
//! so a rejected request costs nothing beyond this check.

use url::Url;

use crate::error::{AuditError, AuditResult};

/// Header carrying the caller credential for single-shot audits
pub const API_KEY_HEADER: &str = "x-api-key";

const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Validate the audit target: present, non-empty, absolute `http`/`https` URL with a host
pub fn validate_target_url(raw: Option<&str>) -> AuditResult<Url> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(AuditError::InvalidInput("Missing url parameter".to_string()));
    }

    let url = Url::parse(raw)
        .map_err(|e| AuditError::InvalidInput(format!("Invalid URL {:?}: {}", raw, e)))?;

    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(AuditError::InvalidInput(format!(
            "URL must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(AuditError::InvalidInput(format!("URL {:?} has no host", raw)));
    }

    Ok(url)
}

/// Check the presented credential against the configured one.
///
/// No configured key means the endpoint is open.
pub fn validate_api_key(expected: Option<&str>, presented: Option<&str>) -> AuditResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };

    match presented {
        None => Err(AuditError::Unauthorized(format!(
            "{} is missing",
            API_KEY_HEADER.to_ascii_uppercase()
        ))),
        Some(key) if key == expected => Ok(()),
        Some(_) => Err(AuditError::Unauthorized(format!(
            "{} is not valid",
            API_KEY_HEADER.to_ascii_uppercase()
        ))),
    }
}
