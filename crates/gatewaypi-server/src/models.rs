//! API Models

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Standard API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorResponse {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

// ============ License ============

/// License activation request
#[derive(Debug, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub customer: String,
}

/// Customer portal link
#[derive(Debug, Serialize, Deserialize)]
pub struct PortalLink {
    pub url: Option<String>,
}

// ============ Gateways ============

/// Heartbeat pushed by a gateway agent
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub ip: IpAddr,
}

// ============ Routes ============

/// `?path=` selector
#[derive(Debug, Serialize, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

/// Target health update
#[derive(Debug, Serialize, Deserialize)]
pub struct TargetHealthUpdate {
    pub path: String,
    pub url: String,
    pub healthy: bool,
}

/// Route enable/disable
#[derive(Debug, Serialize, Deserialize)]
pub struct RouteEnabledUpdate {
    pub path: String,
    pub enabled: bool,
}

// ============ Network ============

/// LAN scan request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub gateway_id: String,
}

// ============ Port forwards ============

/// Forward enable/disable
#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}
