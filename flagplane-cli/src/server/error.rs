use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flagplane_lib::{FlagError, ValidationIssue};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Everything a handler or middleware can answer with besides success.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error("invalid {resource} payload")]
    InvalidPayload {
        resource: &'static str,
        issues: Vec<ValidationIssue>,
    },

    #[error("tenantId is required")]
    MissingTenant,

    #[error("{0}")]
    BadRequest(String),

    #[error("missing bearer token")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Reports validation issues under `resource` rather than as a flag.
    pub fn invalid(resource: &'static str, err: FlagError) -> Self {
        match err {
            FlagError::Validation(issues) => ApiError::InvalidPayload { resource, issues },
            other => ApiError::Flag(other),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Flag(e) => match e {
                FlagError::Validation(_) => StatusCode::BAD_REQUEST,
                FlagError::Conflict { .. } | FlagError::VersionConflict { .. } => {
                    StatusCode::CONFLICT
                }
                FlagError::NotFound { .. } | FlagError::VersionNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                FlagError::QuotaExceeded { .. } | FlagError::RateLimitExceeded { .. } => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                FlagError::TransientStore { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::InvalidPayload { .. } | ApiError::MissingTenant | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = match &self {
            ApiError::Flag(FlagError::Validation(issues)) => json!({
                "error": "invalid flag payload",
                "details": issues,
            }),
            ApiError::InvalidPayload { issues, .. } => json!({
                "error": self.to_string(),
                "details": issues,
            }),
            ApiError::Flag(FlagError::QuotaExceeded {
                tenant_id,
                max_flags,
                used_flags,
            }) => json!({
                "error": "tenant flag quota exceeded",
                "quota": {
                    "tenantId": tenant_id,
                    "maxFlags": max_flags,
                    "usedFlags": used_flags,
                },
            }),
            ApiError::Flag(FlagError::RateLimitExceeded { scope }) => json!({
                "error": self.to_string(),
                "scope": scope,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
