//! Remote browser test service (WebPageTest)
//!
//! A run is started with a pingback URL; the service later calls the pingback with
//! `?id=<test id>` and the results are fetched by id.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CiError, CiResult};

const SERVICE: &str = "WebPageTest";

/// Identifiers of a started remote run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStart {
    #[serde(rename = "testId")]
    pub test_id: String,
    #[serde(rename = "userUrl")]
    pub user_url: String,
}

#[async_trait]
pub trait RemoteTestService: Send + Sync {
    async fn start(&self, test_url: &str, pingback: &str) -> CiResult<TestStart>;

    /// Lighthouse report produced by a finished run
    async fn results(&self, test_id: &str) -> CiResult<serde_json::Value>;

    /// Human readable page for a finished run
    fn report_page(&self, test_id: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    lighthouse: Option<serde_json::Value>,
}

pub struct WebPageTest {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    location: String,
}

impl WebPageTest {
    pub const DEFAULT_LOCATION: &'static str = "Dulles_Nexus5:Nexus 5 - Chrome Beta.3G_EM";

    pub fn new(api_url: impl Into<String>, api_key: Option<String>, location: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
            location: location.into(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> CiResult<T> {
        let response = self
            .client
            .get(format!("{}/{}", self.api_url, path))
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CiError::Upstream {
                service: SERVICE,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RemoteTestService for WebPageTest {
    async fn start(&self, test_url: &str, pingback: &str) -> CiResult<TestStart> {
        let key = self.api_key.as_deref().unwrap_or_default();
        let query = [
            ("k", key),
            ("f", "json"),
            ("pingback", pingback),
            ("location", self.location.as_str()),
            ("mobile", "1"),
            ("type", "lighthouse"),
            ("lighthouse", "1"),
            ("url", test_url),
        ];
        let envelope: Envelope<TestStart> = self.get_json("runtest.php", &query).await?;
        let started = envelope.data.ok_or(CiError::MissingResults(SERVICE))?;
        info!(test_id = %started.test_id, url = %test_url, "WebPageTest run started");
        Ok(started)
    }

    async fn results(&self, test_id: &str) -> CiResult<serde_json::Value> {
        let envelope: Envelope<ResultData> =
            self.get_json("jsonResult.php", &[("test", test_id)]).await?;
        envelope
            .data
            .and_then(|data| data.lighthouse)
            .ok_or(CiError::MissingResults(SERVICE))
    }

    fn report_page(&self, test_id: &str) -> String {
        format!("{}/lighthouse.php?test={}", self.api_url, test_id)
    }
}
