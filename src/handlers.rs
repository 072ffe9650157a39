use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::ThrottlerError;
use crate::health::HealthChecker;
use crate::rate_limiter::StatusSnapshot;
use crate::response::AdminResponse;
use crate::throttler::Throttler;
use crate::validation::RequestValidator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub throttler: Arc<Throttler>,
    pub health: Arc<HealthChecker>,
}

impl AppState {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        let health = Arc::new(HealthChecker::new(Arc::clone(&throttler)));
        Self { throttler, health }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub identifier: String,
    pub limit: u32,
    #[serde(flatten)]
    pub status: StatusSnapshot,
}

/// Get the current accounting for an identifier
pub async fn get_rate_limit(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let identifier = RequestValidator::validate_identifier(&identifier)?;

    let status = state
        .throttler
        .get_status(&identifier)?
        .ok_or_else(|| ThrottlerError::NotFound(format!("No active entry for {}", identifier)))?;

    Ok(Json(StatusResponse {
        limit: state.throttler.quota().points,
        identifier,
        status,
    }))
}

/// Drop the accounting for a single identifier
pub async fn delete_rate_limit(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let identifier = RequestValidator::validate_identifier(&identifier)?;

    if state.throttler.delete(&identifier)? {
        Ok(Json(AdminResponse::success("Rate limit entry deleted")))
    } else {
        Err(ThrottlerError::NotFound(format!(
            "No entry for {}",
            identifier
        )))
    }
}

/// Clear every entry, active blocks included
pub async fn reset_rate_limits(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ThrottlerError> {
    state.throttler.reset()?;
    Ok(Json(AdminResponse::success("All rate limit state cleared")))
}

/// Decision counters
pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.throttler.metrics())
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.check_health();
    let status = if health.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}
