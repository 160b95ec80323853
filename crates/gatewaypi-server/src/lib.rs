//! GatewayPi Server
//!
//! REST surface of the dashboard backend. Every response uses the
//! `{success, data, error}` envelope; control plane errors map onto HTTP
//! statuses in [`error::ApiError`].

pub mod config;
pub mod error;
pub mod models;
pub mod routes;

use axum::routing::get;
use axum::Router;
use gatewaypi_control::{ControlPlane, TelemetrySender};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use models::*;

/// Shared handler state
pub struct AppState {
    pub plane: Arc<ControlPlane>,
    pub telemetry: TelemetrySender,
    pub version: String,
}

impl AppState {
    pub fn new(plane: Arc<ControlPlane>, telemetry: TelemetrySender) -> Self {
        Self {
            plane,
            telemetry,
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/license", routes::license::router())
        .nest("/gateways", routes::gateways::router())
        .nest("/routes", routes::routing::router())
        .nest("/dns", routes::dns::router())
        .nest("/network", routes::network::router())
        .nest("/vps", routes::vps::router())
}
