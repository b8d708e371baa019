//! Client for the audit runner's buffered `/ci` endpoint

use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::error::{CiError, CiResult};

const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Debug, Serialize)]
struct CiRequest<'a> {
    url: &'a str,
    format: &'a str,
}

/// Runs Lighthouse on headless Chrome through the audit runner
pub struct BuilderClient {
    client: Client,
    base_url: String,
}

impl BuilderClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Audit `test_url` and return the JSON report
    pub async fn run(&self, test_url: &str, api_key: Option<&str>) -> CiResult<serde_json::Value> {
        let mut request = self
            .client
            .post(format!("{}/ci", self.base_url))
            .json(&CiRequest {
                url: test_url,
                format: "json",
            });
        if let Some(key) = api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        debug!(url = %test_url, builder = %self.base_url, "Requesting headless Chrome audit");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CiError::Upstream {
                service: "Audit runner",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}
