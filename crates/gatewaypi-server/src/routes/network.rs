//! VPS network inventory and LAN scan endpoints

use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use gatewaypi_control::{NetworkInterface, NetworkScan, NetworkService};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/interfaces", get(interfaces))
        .route("/services", get(services))
        .route("/scan", post(scan))
}

pub async fn interfaces(State(state): State<Arc<AppState>>) -> ApiResult<Vec<NetworkInterface>> {
    Ok(Json(ApiResponse::success(state.plane.network_interfaces())))
}

pub async fn services(State(state): State<Arc<AppState>>) -> ApiResult<Vec<NetworkService>> {
    Ok(Json(ApiResponse::success(state.plane.network_services())))
}

/// Discover devices behind a connected gateway
pub async fn scan(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<NetworkScan>>, ApiError> {
    let Json(request) = payload?;
    let scan = state.plane.scan_network(&request.gateway_id).await?;
    Ok(Json(ApiResponse::success(scan)))
}
