use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::rest::{self, AppState};
use crate::collector::HostDeviceAttributes;
use crate::config::{ConfigPaths, DaemonConfig};
use crate::status::StatusStore;
use crate::telemetry::auth::{CredentialResolver, HttpTokenProvider};
use crate::telemetry::transmitter::Transmitter;
use crate::telemetry::TelemetryPipeline;

pub async fn run(config: DaemonConfig) -> Result<()> {
    // Init tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "iiq-companion agent starting");

    let config_paths = ConfigPaths::default_paths()?;
    let status = Arc::new(StatusStore::new(StatusStore::default_path()?));

    // Telemetry pipeline: credential resolver over the tenant identity
    // provider, transmitter, and the single-consumer controller loop.
    let token_http = reqwest::Client::builder()
        .build()
        .context("building identity provider HTTP client")?;
    let resolver = CredentialResolver::new(HttpTokenProvider::new(token_http));
    let transmitter = Transmitter::new(resolver).context("building telemetry transmitter")?;
    let pipeline = Arc::new(TelemetryPipeline::new(
        transmitter,
        HostDeviceAttributes::default(),
        status.clone(),
        config_paths,
    ));

    let (handle, commands) = TelemetryPipeline::<HttpTokenProvider, HostDeviceAttributes>::channel();
    let pipeline_task = tokio::spawn(pipeline.run(commands));

    let app_state = AppState {
        status,
        attributes: Arc::new(HostDeviceAttributes::default()),
        pipeline: handle,
        started_at: Instant::now(),
    };

    let app = rest::router(app_state).layer(TraceLayer::new_for_http());

    let http_addr = &config.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(addr = %http_addr, "HTTP server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    pipeline_task.abort();
    info!("iiq-companion agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
