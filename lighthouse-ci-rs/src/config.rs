//! # Lighthouse CI Configuration

use std::net::SocketAddr;

use config_rs::{
    env_optional, env_string, get_bind_address, get_client_address, get_default_port, ConfigError,
};

use crate::webpagetest::WebPageTest;

pub const SERVICE_NAME: &str = "LIGHTHOUSE_CI";

#[derive(Debug, Clone)]
pub struct CiConfig {
    pub bind_addr: SocketAddr,

    /// GitHub REST API root
    pub github_api_url: String,

    /// OAuth token with `repo:status` access
    pub oauth_token: Option<String>,

    pub wpt_api_url: String,
    pub wpt_api_key: Option<String>,
    pub wpt_location: String,

    /// Audit runner origin serving `POST /ci`
    pub builder_url: String,

    /// Forwarded to the audit runner when the caller sends no key of its own
    pub lighthouse_api_key: Option<String>,

    /// Origin used for the WebPageTest pingback; derived from `Host` when unset
    pub public_base_url: Option<String>,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], get_default_port(SERVICE_NAME))),
            github_api_url: "https://api.github.com".to_string(),
            oauth_token: None,
            wpt_api_url: "https://www.webpagetest.org".to_string(),
            wpt_api_key: None,
            wpt_location: WebPageTest::DEFAULT_LOCATION.to_string(),
            builder_url: "http://localhost:8080".to_string(),
            lighthouse_api_key: None,
            public_base_url: None,
        }
    }
}

impl CiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            bind_addr: get_bind_address(SERVICE_NAME, get_default_port(SERVICE_NAME)),
            github_api_url: env_string("GITHUB_API_URL", &defaults.github_api_url),
            oauth_token: env_optional("OAUTH_TOKEN"),
            wpt_api_url: env_string("WPT_API_URL", &defaults.wpt_api_url),
            wpt_api_key: env_optional("WPT_API_KEY"),
            wpt_location: env_string("WPT_LOCATION", &defaults.wpt_location),
            builder_url: env_optional("BUILDER_URL").unwrap_or_else(|| {
                get_client_address("AUDIT_RUNNER", get_default_port("AUDIT_RUNNER"), None)
            }),
            lighthouse_api_key: env_optional("LIGHTHOUSE_API_KEY"),
            public_base_url: env_optional("PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
        };

        config.validate()?;

        if config.oauth_token.is_none() {
            tracing::warn!("OAUTH_TOKEN is not set; GitHub status updates will be rejected");
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("GITHUB_API_URL", &self.github_api_url),
            ("WPT_API_URL", &self.wpt_api_url),
            ("BUILDER_URL", &self.builder_url),
        ] {
            url::Url::parse(value).map_err(|_| ConfigError::invalid(name, value.as_str()))?;
        }
        Ok(())
    }
}
