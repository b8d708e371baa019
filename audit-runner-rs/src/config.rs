//! # Audit Runner Configuration
//!
//! Environment driven settings for the HTTP service and the Lighthouse launcher.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use config_rs::{
    env_list, env_optional, env_parse, env_string, get_bind_address, get_default_port, ConfigError,
};
use tracing::debug;

use crate::launcher::{LauncherConfig, DEFAULT_TIMEOUT_SECS};

pub const SERVICE_NAME: &str = "AUDIT_RUNNER";

/// Audit runner service configuration
#[derive(Debug, Clone)]
pub struct AuditRunnerConfig {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,

    /// Directory holding report artifacts; only its `published` part is served under `/reports`
    pub artifact_dir: PathBuf,

    /// How to invoke Lighthouse
    pub launcher: LauncherConfig,

    /// Credential required by `/ci`; `None` leaves it open
    pub api_key: Option<String>,

    /// Origin used in report links; derived from the `Host` header when unset
    pub public_base_url: Option<String>,
}

impl Default for AuditRunnerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], get_default_port(SERVICE_NAME))),
            artifact_dir: PathBuf::from("reports"),
            launcher: LauncherConfig::default(),
            api_key: None,
            public_base_url: None,
        }
    }
}

impl AuditRunnerConfig {
    /// Load from the environment, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = LauncherConfig::default();
        let launcher = LauncherConfig {
            program: env_string("LIGHTHOUSE_BIN", &defaults.program),
            leading_args: env_list("LIGHTHOUSE_ARGS"),
            extra_args: env_list("LIGHTHOUSE_EXTRA_ARGS"),
            working_dir: env_optional("LIGHTHOUSE_WORKDIR").map(PathBuf::from),
            chrome_flags: env_string("CHROME_FLAGS", &defaults.chrome_flags),
            timeout: Duration::from_secs(env_parse("AUDIT_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)),
        };

        let config = Self {
            bind_addr: get_bind_address(SERVICE_NAME, get_default_port(SERVICE_NAME)),
            artifact_dir: PathBuf::from(env_string("ARTIFACT_DIR", "reports")),
            launcher,
            api_key: env_optional("AUDIT_API_KEY"),
            public_base_url: env_optional("PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
        };

        config.validate()?;
        debug!(bind_addr = %config.bind_addr, artifact_dir = %config.artifact_dir.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.launcher.program.trim().is_empty() {
            return Err(ConfigError::invalid("LIGHTHOUSE_BIN", self.launcher.program.as_str()));
        }

        if self.artifact_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("ARTIFACT_DIR", ""));
        }

        if self.launcher.timeout.is_zero() {
            return Err(ConfigError::invalid("AUDIT_TIMEOUT_SECS", "0"));
        }

        if let Some(base) = &self.public_base_url {
            if !(base.starts_with("http://") || base.starts_with("https://")) {
                return Err(ConfigError::invalid("PUBLIC_BASE_URL", base.as_str()));
            }
        }

        Ok(())
    }
}
