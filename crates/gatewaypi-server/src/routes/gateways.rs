//! Gateway endpoints

use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use gatewaypi_control::{ControlError, Gateway, GatewayRemoval, GatewaySpec, InstallArtifact, TelemetryEvent};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_gateways).post(register_gateway))
        .route("/:id", delete(remove_gateway))
        .route("/:id/install", post(issue_install))
        .route("/:id/heartbeat", post(heartbeat))
}

pub async fn list_gateways(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Gateway>> {
    Ok(Json(ApiResponse::success(state.plane.gateways.list())))
}

pub async fn register_gateway(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GatewaySpec>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Gateway>>), ApiError> {
    let Json(spec) = payload?;
    let gateway = state.plane.register_gateway(spec)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(gateway))))
}

pub async fn remove_gateway(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<GatewayRemoval> {
    let removal = state.plane.remove_gateway(&id).await?;
    Ok(Json(ApiResponse::success(removal)))
}

/// Install command; every call after the first rotates the tunnel key
pub async fn issue_install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<InstallArtifact> {
    let artifact = state.plane.issue_install_artifact(&id).await?;
    Ok(Json(ApiResponse::success(artifact)))
}

/// Queue a heartbeat for the ingest task
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<()>>), ApiError> {
    let Json(request) = payload?;
    if state.plane.gateways.get(&id).is_none() {
        return Err(ControlError::NotFound(format!("gateway {}", id)).into());
    }

    state
        .telemetry
        .send(TelemetryEvent::Heartbeat {
            gateway_id: id,
            source_ip: request.ip,
            at: Utc::now(),
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(()))))
}
