//! GatewayPi Server - Main Entry Point

use gatewaypi_control::{monitor, telemetry, ControlPlane};
use gatewaypi_server::{build_router, AppState, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("GatewayPi Server v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "/etc/gatewaypi/server.json".into());

    let config = ServerConfig::load(&config_path)
        .unwrap_or_else(|e| {
            tracing::warn!("Config {} not usable ({}), using defaults", config_path, e);
            ServerConfig::default()
        });

    let plane = Arc::new(ControlPlane::new(config.control.clone())?);
    plane.init();

    // Background tasks
    let (telemetry_tx, telemetry_rx) = telemetry::channel(config.telemetry_buffer);
    tokio::spawn(telemetry::run_ingest(plane.clone(), telemetry_rx));
    tokio::spawn(monitor::start_liveness_monitor(plane.clone()));
    tokio::spawn(monitor::start_license_refresher(plane.clone()));

    let app = build_router(AppState::new(plane, telemetry_tx));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("GatewayPi Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
