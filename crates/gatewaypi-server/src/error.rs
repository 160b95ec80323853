//! API error mapping

use crate::models::ApiResponse;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gatewaypi_control::ControlError;
use thiserror::Error;

/// Error returned by handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        let err = match self {
            Self::Control(err) => err,
            Self::BadRequest(_) => return StatusCode::BAD_REQUEST,
        };

        match err {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::QuotaExceeded { .. }
            | ControlError::LicenseInactive(_)
            | ControlError::FeatureNotEntitled(_) => StatusCode::FORBIDDEN,
            ControlError::DuplicatePath(_)
            | ControlError::PortInUse { .. }
            | ControlError::KeyConflict(_) => StatusCode::CONFLICT,
            ControlError::InvalidTarget(_) | ControlError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ControlError::NoHealthyTarget(_) | ControlError::ExternalUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ControlError::SubnetPoolExhausted => StatusCode::INSUFFICIENT_STORAGE,
            ControlError::Config(_) | ControlError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Control(err) => err.code(),
            Self::BadRequest(_) => "BAD_REQUEST",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("{} {}", status, self);
        } else {
            tracing::debug!("{} {}", status, self);
        }
        let body = ApiResponse::<()>::error(self.code(), &self.to_string());
        (status, Json(body)).into_response()
    }
}

/// Handler result
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;
