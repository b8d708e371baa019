// lighthouse-ci-rs/src/main.rs
// Lighthouse CI - pull request status reporting
// Port 8081 - /run_on_chrome, /run_on_wpt and the WebPageTest pingback

use std::sync::Arc;

use anyhow::Context;
use lighthouse_ci::{CiConfig, CiService};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config_rs::load_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CiConfig::from_env()
        .context("invalid lighthouse ci configuration")?;
    let addr = config.bind_addr;

    let app = Arc::new(CiService::new(&config)).create_router();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    tracing::info!("Lighthouse CI starting on {}", addr);
    tracing::info!(builder = %config.builder_url, github = %config.github_api_url, "Collaborators configured");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
