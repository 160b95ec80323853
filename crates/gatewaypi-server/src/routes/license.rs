//! License endpoints

use crate::error::ApiResult;
use crate::models::*;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use gatewaypi_control::LicenseInfo;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_license).delete(deactivate))
        .route("/activate", axum::routing::post(activate))
        .route("/portal", get(portal_link))
}

/// Current license; `data` is null before activation
pub async fn get_license(State(state): State<Arc<AppState>>) -> ApiResult<Option<LicenseInfo>> {
    Ok(Json(ApiResponse::success(state.plane.license_info())))
}

pub async fn activate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ActivateRequest>, JsonRejection>,
) -> ApiResult<LicenseInfo> {
    let Json(request) = payload?;
    let info = state.plane.activate(&request.customer).await?;
    Ok(Json(ApiResponse::success(info)))
}

pub async fn deactivate(State(state): State<Arc<AppState>>) -> ApiResult<()> {
    state.plane.deactivate()?;
    Ok(Json(ApiResponse::success(())))
}

pub async fn portal_link(State(state): State<Arc<AppState>>) -> ApiResult<PortalLink> {
    let url = state.plane.portal_link().await?;
    Ok(Json(ApiResponse::success(PortalLink { url })))
}
