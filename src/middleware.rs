use axum::extract::{ConnectInfo, Query, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error};

use crate::key_generator::RequestSignals;
use crate::response::{forbidden_response, too_many_requests_response};
use crate::throttler::{Decision, RequestContext, Throttler};

/// Rate limiting middleware.
///
/// Mount with `axum::middleware::from_fn_with_state(throttler, rate_limit_middleware)`.
/// The peer address comes from `ConnectInfo<SocketAddr>`, so the server must
/// be served with `into_make_service_with_connect_info`.
pub async fn rate_limit_middleware(
    State(throttler): State<Arc<Throttler>>,
    request: Request,
    next: Next,
) -> Response {
    let signals = request_signals(&request);
    let context = RequestContext::new(request.uri().path());

    let decision = match throttler.check(&signals, &context) {
        Ok(decision) => decision,
        Err(err) => {
            error!(
                target: "throttler::middleware",
                path = %context.path,
                error = %err,
                "Rate limit check failed"
            );
            return err.into_response();
        }
    };

    match decision {
        Decision::Bypass | Decision::Unidentified => next.run(request).await,
        Decision::Forbidden { .. } => forbidden_response(),
        Decision::RateLimited { info, .. } => too_many_requests_response(&info),
        Decision::Admitted { info, .. } => {
            let mut response = next.run(request).await;
            // Advisory headers only belong on a successful response.
            if response.status().is_success() {
                info.apply_headers(response.headers_mut());
            } else {
                debug!(
                    target: "throttler::middleware",
                    status = %response.status(),
                    "Skipping rate limit headers on unsuccessful response"
                );
            }
            response
        }
    }
}

/// Collect the resolver inputs from an incoming request.
pub fn request_signals(request: &Request) -> RequestSignals {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .map(|Query(query)| query)
        .unwrap_or_default();

    RequestSignals {
        peer,
        headers: request.headers().clone(),
        query,
    }
}
