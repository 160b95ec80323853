//! VPS status and port forward endpoints

use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use gatewaypi_control::{FleetStatus, ForwardStatus, PortForward, PortForwardSpec};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(status))
        .route("/port-forwards", get(list_forwards).post(add_forward))
        .route("/port-forwards/:id", delete(remove_forward))
        .route("/port-forwards/:id/toggle", put(toggle_forward))
        .route("/port-forwards/:id/status", get(forward_status))
}

/// VPS metrics plus per-gateway connectivity
pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult<FleetStatus> {
    Ok(Json(ApiResponse::success(state.plane.fleet_snapshot())))
}

pub async fn list_forwards(State(state): State<Arc<AppState>>) -> ApiResult<Vec<PortForward>> {
    Ok(Json(ApiResponse::success(state.plane.forwards.list())))
}

pub async fn add_forward(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PortForwardSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<PortForward>>), ApiError> {
    let Json(spec) = payload?;
    let forward = state.plane.add_port_forward(spec)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(forward))))
}

pub async fn remove_forward(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<PortForward> {
    let forward = state.plane.remove_port_forward(&id)?;
    Ok(Json(ApiResponse::success(forward)))
}

pub async fn toggle_forward(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<ToggleRequest>, JsonRejection>,
) -> ApiResult<PortForward> {
    let Json(request) = payload?;
    let forward = state.plane.toggle_port_forward(&id, request.enabled)?;
    Ok(Json(ApiResponse::success(forward)))
}

pub async fn forward_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ForwardStatus> {
    let status = state.plane.forwards.status(&id)?;
    Ok(Json(ApiResponse::success(status)))
}
