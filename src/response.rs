use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Public body of a denied request. The identifier is never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub status_code: u16,
    pub error: &'static str,
    pub message: &'static str,
}

impl DenialBody {
    pub fn too_many_requests() -> Self {
        Self {
            status_code: 429,
            error: "Too Many Requests",
            message: "Rate limit exceeded",
        }
    }

    pub fn forbidden() -> Self {
        Self {
            status_code: 403,
            error: "Forbidden",
            message: "Access forbidden",
        }
    }
}

impl IntoResponse for DenialBody {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::FORBIDDEN);
        (status, Json(self)).into_response()
    }
}

/// Quota figures advertised on admitted and throttled responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    /// Reset or block expiry in ms since the epoch.
    pub reset_at: u64,
    /// Time the decision was taken, in ms since the epoch.
    pub now: u64,
}

impl RateLimitInfo {
    /// `RateLimit-Reset` value: Unix seconds, rounded up.
    pub fn reset_unix_secs(&self) -> u64 {
        self.reset_at.div_ceil(1000)
    }

    /// `Retry-After` value: whole seconds until reset, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_at.saturating_sub(self.now).div_ceil(1000)
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(self.reset_unix_secs()));
    }
}

/// 429 with the rate limit headers and `Retry-After`.
pub fn too_many_requests_response(info: &RateLimitInfo) -> Response {
    let mut response = DenialBody::too_many_requests().into_response();
    let headers = response.headers_mut();
    info.apply_headers(headers);
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(0u32));
    headers.insert(
        axum::http::header::RETRY_AFTER,
        HeaderValue::from(info.retry_after_secs()),
    );
    response
}

pub fn forbidden_response() -> Response {
    DenialBody::forbidden().into_response()
}

#[derive(Debug, Serialize)]
pub struct AdminResponse {
    pub status: String,
    pub message: String,
}

impl AdminResponse {
    pub fn success(message: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
        }
    }
}
