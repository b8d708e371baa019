//! config-rs/lib.rs
//! Shared configuration utilities for the audit services
//! Provides standardized port/address management and typed environment lookups

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

/// Errors raised while validating service configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: String, value: String },
}

impl ConfigError {
    pub fn invalid(name: &str, value: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// Load a `.env` file from the working directory if one exists
pub fn load_env() {
    if dotenv::dotenv().is_ok() {
        log::debug!("Loaded environment from .env");
    }
}

/// Get service port from environment variables with proper fallback
///
/// # Arguments
/// * `service_name` - The name of the service (e.g., "AUDIT_RUNNER", "LIGHTHOUSE_CI")
/// * `default_port` - The default port to use if not specified in environment
///
/// # Returns
/// The port number to use for the service
pub fn get_service_port(service_name: &str, default_port: u16) -> u16 {
    let var_name = format!("{}_SERVICE_PORT", service_name.to_uppercase());
    match env::var(&var_name) {
        Ok(raw) => raw.parse::<u16>().unwrap_or_else(|_| {
            log::warn!("Invalid port in {}, using default {}", var_name, default_port);
            default_port
        }),
        // Bare PORT is what most hosting platforms inject
        Err(_) => env_parse("PORT", default_port),
    }
}

/// Create a SocketAddr for binding a service
///
/// `<SERVICE>_SERVICE_ADDR` may hold either `host:port` or `http://host:port`.
pub fn get_bind_address(service_name: &str, default_port: u16) -> SocketAddr {
    let var_name = format!("{}_SERVICE_ADDR", service_name.to_uppercase());

    if let Ok(addr_str) = env::var(&var_name) {
        let trimmed = addr_str
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&addr_str);
        match trimmed.parse::<SocketAddr>() {
            Ok(addr) => return addr,
            Err(_) => log::warn!("Invalid address format in {}, using default", var_name),
        }
    }

    let port = get_service_port(service_name, default_port);
    SocketAddr::from(([0, 0, 0, 0], port))
}

/// Get client connection address for connecting to a service
///
/// # Arguments
/// * `service_name` - The name of the service
/// * `default_port` - The default port to use if not specified in environment
/// * `host` - Optional host to use if not specified in environment (default: "localhost")
pub fn get_client_address(service_name: &str, default_port: u16, host: Option<&str>) -> String {
    let addr_var_name = format!("{}_SERVICE_ADDR", service_name.to_uppercase());
    let port_var_name = format!("{}_SERVICE_PORT", service_name.to_uppercase());

    if let Ok(addr) = env::var(&addr_var_name) {
        return addr;
    }

    let port = env::var(&port_var_name)
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(default_port);

    let host = host.unwrap_or("localhost");
    format!("http://{}:{}", host, port)
}

/// Get default port for a specific service
pub fn get_default_port(service_name: &str) -> u16 {
    match service_name.to_uppercase().as_str() {
        "AUDIT_RUNNER" => 8080,
        "LIGHTHOUSE_CI" => 8081,
        _ => 8100,
    }
}

/// Read a string variable, falling back to `default` when unset
pub fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read an optional string variable; empty values count as unset
pub fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Read and parse a variable, warning and falling back on malformed input
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            log::warn!("Invalid value {:?} in {}, using default", raw, name);
            default
        }),
        Err(_) => default,
    }
}

/// Read a whitespace separated list
pub fn env_list(name: &str) -> Vec<String> {
    env_optional(name)
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_service_port() {
        std::env::set_var("CFGTEST_SERVICE_PORT", "9000");
        assert_eq!(get_service_port("cfgtest", 8000), 9000);

        std::env::set_var("CFGTEST_BAD_SERVICE_PORT", "not-a-port");
        assert_eq!(get_service_port("cfgtest_bad", 8000), 8000);
    }

    #[test]
    fn test_get_bind_address_accepts_url_form() {
        std::env::set_var("CFGBIND_SERVICE_ADDR", "http://127.0.0.1:7001");
        assert_eq!(
            get_bind_address("cfgbind", 8000),
            "127.0.0.1:7001".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_get_client_address() {
        std::env::set_var("CFGCLIENT_SERVICE_ADDR", "http://example.com:9000");
        assert_eq!(get_client_address("cfgclient", 8000, None), "http://example.com:9000");

        std::env::remove_var("CFGCLIENT2_SERVICE_ADDR");
        std::env::set_var("CFGCLIENT2_SERVICE_PORT", "9001");
        assert_eq!(get_client_address("cfgclient2", 8000, None), "http://localhost:9001");

        assert_eq!(
            get_client_address("cfgclient3", 8000, Some("service.local")),
            "http://service.local:8000"
        );
    }

    #[test]
    fn test_env_helpers() {
        std::env::set_var("CFGTEST_LIST", "  --a  --b ");
        assert_eq!(env_list("CFGTEST_LIST"), vec!["--a", "--b"]);

        std::env::set_var("CFGTEST_NUM", "12x");
        assert_eq!(env_parse("CFGTEST_NUM", 5u64), 5);

        std::env::set_var("CFGTEST_EMPTY", "   ");
        assert!(env_optional("CFGTEST_EMPTY").is_none());
    }
}
