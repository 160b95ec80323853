//! Health check endpoint

use crate::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub services: ServiceHealth,
}

#[derive(Serialize)]
pub struct ServiceHealth {
    pub license: String,
    pub telemetry: String,
    pub gateways_connected: usize,
    pub gateways_total: usize,
}

/// Health check
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let license = match state.plane.license_info() {
        Some(info) => serde_json::to_value(info.status)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "unknown".into()),
        None => "none".into(),
    };
    let telemetry = if state.telemetry.is_closed() { "stopped" } else { "running" };
    let fleet = state.plane.fleet_snapshot();
    let status = if telemetry == "running" { "healthy" } else { "degraded" };

    Json(HealthResponse {
        status: status.into(),
        version: state.version.clone(),
        timestamp: Utc::now().to_rfc3339(),
        services: ServiceHealth {
            license,
            telemetry: telemetry.into(),
            gateways_connected: fleet.connected_gateways,
            gateways_total: fleet.total_gateways,
        },
    })
}
