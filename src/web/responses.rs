//! HTTP response types and error mapping for the web layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, RepositoryError, WebError};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

pub fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

pub fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::success(data))).into_response()
}

pub fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::Validation { .. } | AppError::Web(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound { .. } => StatusCode::NOT_FOUND,
        AppError::Repository(RepositoryError::RecordNotFound { .. }) => StatusCode::NOT_FOUND,
        AppError::Repository(RepositoryError::ConstraintViolation { .. }) => StatusCode::CONFLICT,
        AppError::ManagementUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Source(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        AppError::Source(_) | AppError::Http(_) => StatusCode::BAD_GATEWAY,
        AppError::Database(_)
        | AppError::Repository(_)
        | AppError::Configuration { .. }
        | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert AppError to an HTTP response, hiding storage internals
pub fn handle_error(error: AppError) -> Response {
    let status = status_for(&error);
    let message = match &error {
        AppError::Database(_) => "Database operation failed".to_string(),
        AppError::Repository(RepositoryError::MigrationFailed { .. }) => "Data access failed".to_string(),
        AppError::Web(WebError::MissingHeader { header }) => format!("Missing header: {}", header),
        other => other.to_string(),
    };

    if status.is_server_error() {
        tracing::error!("Request failed: {}", error);
    } else {
        tracing::debug!("Request rejected: {}", error);
    }

    (status, Json(ApiResponse::<()>::error(message))).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        handle_error(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SourceError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&AppError::not_found("source", "1")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&AppError::Source(SourceError::timeout("http://x"))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&AppError::management_unavailable("down")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&AppError::Web(WebError::missing_header("action"))),
            StatusCode::BAD_REQUEST
        );
    }
}
