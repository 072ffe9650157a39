//! Per-identifier fixed-window rate limiting with block windows, for axum services.
//!
//! Requests are mapped to an identifier (`ip:<addr>` or `key:<api key>`) by
//! [`key_generator::IdentifierResolver`], charged against a fixed window by
//! [`rate_limiter::RateLimiter`] and turned into an HTTP outcome by
//! [`middleware::rate_limit_middleware`].

pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod storage;
pub mod throttler;
pub mod validation;

pub use config::Config;
pub use error::{ThrottlerError, ThrottlerResult};
pub use rate_limit_config::QuotaConfig;
pub use server::create_app;
pub use throttler::{Decision, RequestContext, Throttler};
