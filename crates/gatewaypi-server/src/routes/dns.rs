//! DNS endpoints

use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use gatewaypi_control::{DnsRecord, DnsRecordSpec, DnsStats};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/records", get(list_records).post(upsert_record))
        .route("/records/:hostname", delete(remove_record))
        .route("/stats", get(stats))
}

pub async fn list_records(State(state): State<Arc<AppState>>) -> ApiResult<Vec<DnsRecord>> {
    Ok(Json(ApiResponse::success(state.plane.dns.list())))
}

/// Create or overwrite the record for a hostname
pub async fn upsert_record(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DnsRecordSpec>, JsonRejection>,
) -> Result<Json<ApiResponse<DnsRecord>>, ApiError> {
    let Json(spec) = payload?;
    let record = state.plane.upsert_dns_record(spec)?;
    Ok(Json(ApiResponse::success(record)))
}

pub async fn remove_record(
    State(state): State<Arc<AppState>>,
    Path(hostname): Path<String>,
) -> ApiResult<DnsRecord> {
    let record = state.plane.remove_dns_record(&hostname)?;
    Ok(Json(ApiResponse::success(record)))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<DnsStats> {
    Ok(Json(ApiResponse::success(state.plane.dns.stats())))
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use axum::http::StatusCode;
    use gatewaypi_control::Plan;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_remove_and_stats() {
        let (app, plane) = activated_app(Plan::Starter).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/dns/records",
            Some(json!({ "hostname": "NAS.home.lan", "ip": "192.168.1.20" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["hostname"], "nas.home.lan");
        assert_eq!(body["data"]["ttl"], 300);

        let (status, body) = call(
            &app,
            "POST",
            "/api/dns/records",
            Some(json!({ "hostname": "nas.home.lan", "ip": "192.168.1.20", "ttl": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_INPUT");

        for hit in [true, true, true, false] {
            plane.dns.record_query(hit);
        }
        let (_, body) = call(&app, "GET", "/api/dns/stats", None).await;
        assert_eq!(body["data"]["totalQueries"], 4);
        assert_eq!(body["data"]["cacheMiss"], 1);
        assert_eq!(body["data"]["successRate"], 0.75);

        let (status, _) = call(&app, "DELETE", "/api/dns/records/nas.home.lan", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "DELETE", "/api/dns/records/nas.home.lan", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
