use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Callback error: {0}")]
    CallbackError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::ConfigurationError(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &ThrottlerError) -> Self {
        match err {
            ThrottlerError::ConfigurationError(msg) => Self::new("configuration_error", msg, 500),
            ThrottlerError::CallbackError(msg) => Self::new("callback_error", msg, 500),
            ThrottlerError::ValidationError(msg) => Self::new("validation_error", msg, 422),
            ThrottlerError::NotFound(msg) => Self::new("not_found", msg, 404),
            ThrottlerError::InternalError(msg) => Self::new("internal_error", msg, 500),
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_maps_to_500() {
        let err = ThrottlerError::InternalError("lock poisoned".to_string());
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.code, 500);
        assert_eq!(body.error, "internal_error");
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_validation_error_maps_to_422() {
        let err = ThrottlerError::ValidationError("bad identifier".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = ThrottlerError::NotFound("ip:10.0.0.1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
