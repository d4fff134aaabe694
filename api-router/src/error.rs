use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use common::error::AppError;
use common::utils::config::RuntimeEnvironment;
use serde::Serialize;

/// API-facing error. Every response body carries the correlation id and
/// an ISO-8601 timestamp alongside the message.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub correlation_id: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        }
    }

    pub fn not_found(message: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        }
    }

    /// Map an internal error onto the HTTP surface. Unexpected errors are
    /// redacted to a generic message outside development.
    pub fn from_app(
        err: AppError,
        correlation_id: &str,
        environment: RuntimeEnvironment,
    ) -> Self {
        match err {
            AppError::Validation(message) => Self::validation(message, correlation_id),
            AppError::NotFound(message) => Self::not_found(message, correlation_id),
            AppError::IllegalState(message) => Self::conflict(message, correlation_id),
            other => {
                tracing::error!(%correlation_id, error = %other, "internal error");
                let message = if environment == RuntimeEnvironment::Development {
                    other.to_string()
                } else {
                    "Internal server error".to_string()
                };
                Self::internal(message, correlation_id)
            }
        }
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    correlation_id: String,
    timestamp: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            correlation_id: self.correlation_id,
            timestamp: Utc::now().to_rfc3339(),
        };

        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_by_kind() {
        assert_eq!(
            ApiError::validation("bad", "c-1").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::not_found("missing", "c-1").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::conflict("already terminal", "c-1")
                .into_response()
                .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::internal("boom", "c-1").into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn app_error_mapping_redacts_outside_development() {
        let err = AppError::InternalError("db password leaked".to_string());
        let prod = ApiError::from_app(err, "c-2", RuntimeEnvironment::Production);
        assert_eq!(prod.message, "Internal server error");

        let err = AppError::InternalError("db password leaked".to_string());
        let dev = ApiError::from_app(err, "c-2", RuntimeEnvironment::Development);
        assert!(dev.message.contains("db password leaked"));
    }

    #[test]
    fn validation_errors_surface_as_400_with_message() {
        let err = AppError::Validation("page must be >= 1".to_string());
        let mapped = ApiError::from_app(err, "c-3", RuntimeEnvironment::Production);
        assert_eq!(mapped.status, StatusCode::BAD_REQUEST);
        assert!(mapped.message.contains("page"));
        assert_eq!(mapped.correlation_id, "c-3");
    }
}
