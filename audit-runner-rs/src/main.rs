// audit-runner-rs/src/main.rs
// Audit Runner - Lighthouse job service
// Port 8080 - buffered reports on /ci, live output on /stream and /log

use std::sync::Arc;

use anyhow::Context;
use audit_runner::{AuditRunner, AuditRunnerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config_rs::load_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AuditRunnerConfig::from_env()
        .context("invalid audit runner configuration")?;
    let addr = config.bind_addr;
    let artifact_dir = config.artifact_dir.clone();
    let program = config.launcher.program.clone();

    let runner = Arc::new(AuditRunner::new(config));
    runner
        .prepare()
        .await
        .with_context(|| format!("creating artifact directory {}", artifact_dir.display()))?;

    let app = runner.create_router();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    tracing::info!("Audit Runner starting on {}", addr);
    tracing::info!(program = %program, artifact_dir = %artifact_dir.display(), "Lighthouse launcher ready");

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
