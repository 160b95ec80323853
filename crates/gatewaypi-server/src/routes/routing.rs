//! HTTP route endpoints

use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::AppState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use gatewaypi_control::{Route, RouteSpec};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_routes).post(add_route).delete(remove_route))
        .route("/health", put(set_target_health))
        .route("/enabled", put(set_route_enabled))
}

pub async fn list_routes(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Route>> {
    Ok(Json(ApiResponse::success(state.plane.routes.list())))
}

pub async fn add_route(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RouteSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Route>>), ApiError> {
    let Json(spec) = payload?;
    let route = state.plane.add_route(spec)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(route))))
}

/// `DELETE /api/routes?path=/api`
pub async fn remove_route(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PathQuery>, QueryRejection>,
) -> ApiResult<Route> {
    let Query(query) = query?;
    let route = state.plane.remove_route(&query.path)?;
    Ok(Json(ApiResponse::success(route)))
}

pub async fn set_target_health(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TargetHealthUpdate>, JsonRejection>,
) -> ApiResult<()> {
    let Json(update) = payload?;
    state
        .plane
        .routes
        .set_target_health(&update.path, &update.url, update.healthy)?;
    Ok(Json(ApiResponse::success(())))
}

pub async fn set_route_enabled(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RouteEnabledUpdate>, JsonRejection>,
) -> ApiResult<Route> {
    let Json(update) = payload?;
    let route = state.plane.set_route_enabled(&update.path, update.enabled)?;
    Ok(Json(ApiResponse::success(route)))
}
