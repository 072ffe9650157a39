use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::config_validator::ConfigValidator;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::key_generator::{BlockReason, IdentifierResolver, IdentifierResult, RequestSignals};
use crate::metrics::{MetricsCollector, ThrottleMetrics};
use crate::rate_limit_config::QuotaConfig;
use crate::rate_limiter::{RateLimiter, StatusSnapshot};
use crate::response::RateLimitInfo;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Hook invoked with the identifier and the request context.
pub type Hook = Arc<dyn Fn(&str, &RequestContext) -> Result<(), BoxError> + Send + Sync>;

/// Pass-through request details handed to hooks for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub path: String,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Outcome of guarding a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Allow-listed; no accounting.
    Bypass,
    /// No identifier could be derived; proceeds without accounting.
    Unidentified,
    Admitted {
        identifier: String,
        info: RateLimitInfo,
    },
    RateLimited {
        identifier: String,
        info: RateLimitInfo,
    },
    Forbidden {
        identifier: String,
        reason: BlockReason,
    },
}

#[derive(Clone, Default)]
pub struct Hooks {
    pub on_rate_limit: Option<Hook>,
    pub on_block: Option<Hook>,
}

/// Main throttler service: resolves the caller, consumes quota and reports
/// the decision.
pub struct Throttler {
    resolver: IdentifierResolver,
    rate_limiter: RateLimiter,
    quota: QuotaConfig,
    cleanup_interval: Duration,
    hooks: Hooks,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("resolver", &self.resolver)
            .field("quota", &self.quota)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Throttler {
    /// Create a new throttler. Invalid configuration is rejected here.
    pub fn new(config: &Config) -> ThrottlerResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, clock: Arc<dyn Clock>) -> ThrottlerResult<Self> {
        ConfigValidator::validate_config(config)?;

        let resolver = IdentifierResolver::new(&config.identity)?;
        let rate_limiter = RateLimiter::with_clock(config.storage.max_size, clock);

        info!(
            target: "throttler::throttler",
            points = config.quota.points,
            duration_ms = config.quota.duration_ms(),
            block_duration_ms = config.quota.block_duration_ms(),
            max_size = config.storage.max_size,
            "Throttler initialised"
        );

        Ok(Self {
            resolver,
            rate_limiter,
            quota: config.quota.clone(),
            cleanup_interval: config.storage.cleanup_interval,
            hooks: Hooks::default(),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn on_rate_limit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &RequestContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hooks.on_rate_limit = Some(Arc::new(hook));
        self
    }

    pub fn on_block<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &RequestContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hooks.on_block = Some(Arc::new(hook));
        self
    }

    /// Start the periodic sweep of expired entries. Requires a tokio runtime.
    pub fn start_cleanup(&self) -> ThrottlerResult<()> {
        self.rate_limiter.start_cleanup(self.cleanup_interval)
    }

    pub fn quota(&self) -> &QuotaConfig {
        &self.quota
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Decide whether the request described by `signals` may proceed.
    pub fn check(&self, signals: &RequestSignals, context: &RequestContext) -> ThrottlerResult<Decision> {
        let decision = match self.resolver.resolve(signals) {
            IdentifierResult::Bypass => {
                self.metrics.record_bypassed();
                Decision::Bypass
            }
            IdentifierResult::Unidentified => {
                self.metrics.record_unidentified();
                Decision::Unidentified
            }
            IdentifierResult::Block { identifier, reason } => {
                self.metrics.record_blocked();
                info!(
                    target: "throttler::throttler",
                    path = %context.path,
                    reason = %reason,
                    "Request blocked"
                );
                self.fire(self.hooks.on_block.as_ref(), "on_block", &identifier, context);
                Decision::Forbidden { identifier, reason }
            }
            IdentifierResult::Identifier(identifier) => self.consume(identifier, context)?,
        };

        Ok(decision)
    }

    fn consume(&self, identifier: String, context: &RequestContext) -> ThrottlerResult<Decision> {
        let now = self.rate_limiter.now_ms();
        let outcome = self
            .rate_limiter
            .consume_at(&identifier, &self.quota, now)?;

        let info = RateLimitInfo {
            limit: self.quota.points,
            remaining: outcome.remaining,
            reset_at: outcome.reset_at,
            now,
        };

        if outcome.allowed {
            self.metrics.record_admitted();
            debug!(
                target: "throttler::throttler",
                identifier = %identifier,
                remaining = outcome.remaining,
                "Request admitted"
            );
            return Ok(Decision::Admitted { identifier, info });
        }

        self.metrics.record_throttled();
        info!(
            target: "throttler::throttler",
            identifier = %identifier,
            path = %context.path,
            retry_after_secs = info.retry_after_secs(),
            "Rate limit exceeded"
        );
        self.fire(
            self.hooks.on_rate_limit.as_ref(),
            "on_rate_limit",
            &identifier,
            context,
        );
        Ok(Decision::RateLimited { identifier, info })
    }

    /// Run a hook, logging any error or panic; the decision is already final.
    fn fire(&self, hook: Option<&Hook>, name: &str, identifier: &str, context: &RequestContext) {
        let Some(hook) = hook else {
            return;
        };

        let error = match catch_unwind(AssertUnwindSafe(|| hook(identifier, context))) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => ThrottlerError::CallbackError(err.to_string()),
            Err(_) => ThrottlerError::CallbackError("hook panicked".to_string()),
        };

        warn!(
            target: "throttler::throttler",
            hook = name,
            path = %context.path,
            error = %error,
            "Hook failed"
        );
    }

    pub fn get_status(&self, identifier: &str) -> ThrottlerResult<Option<StatusSnapshot>> {
        self.rate_limiter.get_status(identifier)
    }

    pub fn delete(&self, identifier: &str) -> ThrottlerResult<bool> {
        self.rate_limiter.delete(identifier)
    }

    /// Clear all accounting and counters.
    pub fn reset(&self) -> ThrottlerResult<()> {
        self.rate_limiter.reset()?;
        self.metrics.reset();
        info!(target: "throttler::throttler", "Rate limit state reset");
        Ok(())
    }

    pub fn metrics(&self) -> ThrottleMetrics {
        self.metrics.snapshot()
    }

    /// Stop the sweep and drop all state. Called once at shutdown.
    pub fn destroy(&self) -> ThrottlerResult<()> {
        self.rate_limiter.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Channel, IdentityConfig, IpOptions, KeyOptions};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T0: u64 = 1_700_000_000_000;

    fn config(points: u32, duration: Duration, block: Duration) -> Config {
        Config {
            quota: QuotaConfig::new(points, duration, block),
            ..Config::default()
        }
    }

    fn peer(addr: &str) -> RequestSignals {
        RequestSignals::new(Some(addr.parse::<IpAddr>().unwrap()))
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let bad = config(0, Duration::from_secs(1), Duration::ZERO);
        assert!(matches!(
            Throttler::new(&bad),
            Err(ThrottlerError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_admits_then_limits() {
        let clock = ManualClock::new(T0);
        let throttler = Throttler::with_clock(
            &config(2, Duration::from_secs(10), Duration::ZERO),
            Arc::new(clock.clone()),
        )
        .unwrap();
        let ctx = RequestContext::new("/api");

        for remaining in [1, 0] {
            match throttler.check(&peer("192.0.2.1"), &ctx).unwrap() {
                Decision::Admitted { identifier, info } => {
                    assert_eq!(identifier, "ip:192.0.2.1");
                    assert_eq!(info.remaining, remaining);
                    assert_eq!(info.limit, 2);
                }
                other => panic!("expected admission, got {:?}", other),
            }
        }

        clock.advance(Duration::from_millis(2_500));
        match throttler.check(&peer("192.0.2.1"), &ctx).unwrap() {
            Decision::RateLimited { info, .. } => {
                assert_eq!(info.reset_at, T0 + 10_000);
                assert_eq!(info.retry_after_secs(), 8);
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_after_follows_block_window() {
        let clock = ManualClock::new(T0);
        let throttler = Throttler::with_clock(
            &config(1, Duration::from_secs(10), Duration::from_secs(120)),
            Arc::new(clock),
        )
        .unwrap();
        let ctx = RequestContext::default();

        throttler.check(&peer("192.0.2.1"), &ctx).unwrap();
        match throttler.check(&peer("192.0.2.1"), &ctx).unwrap() {
            Decision::RateLimited { info, .. } => assert_eq!(info.retry_after_secs(), 120),
            other => panic!("expected rate limit, got {:?}", other),
        }
    }

    #[test]
    fn test_hooks_fire_and_failures_are_contained() {
        let limited = Arc::new(AtomicUsize::new(0));
        let blocked = Arc::new(AtomicUsize::new(0));
        let limited_count = Arc::clone(&limited);
        let blocked_count = Arc::clone(&blocked);

        let mut cfg = config(1, Duration::from_secs(60), Duration::ZERO);
        cfg.identity = IdentityConfig {
            ip: Channel::Custom(IpOptions {
                block_list: vec!["198.51.100.1".to_string()],
                ..IpOptions::default()
            }),
            key: Channel::Unset,
        };

        let throttler = Throttler::new(&cfg)
            .unwrap()
            .on_rate_limit(move |identifier, ctx| {
                assert_eq!(identifier, "ip:192.0.2.1");
                assert_eq!(ctx.path, "/hooks");
                limited_count.fetch_add(1, Ordering::SeqCst);
                Err("hook exploded".into())
            })
            .on_block(move |_, _| {
                blocked_count.fetch_add(1, Ordering::SeqCst);
                panic!("hook panicked");
            });
        let ctx = RequestContext::new("/hooks");

        throttler.check(&peer("192.0.2.1"), &ctx).unwrap();
        let decision = throttler.check(&peer("192.0.2.1"), &ctx).unwrap();
        assert!(matches!(decision, Decision::RateLimited { .. }));

        let decision = throttler.check(&peer("198.51.100.1"), &ctx).unwrap();
        assert!(matches!(
            decision,
            Decision::Forbidden { reason: BlockReason::IpBlocked, .. }
        ));

        assert_eq!(limited.load(Ordering::SeqCst), 1);
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unidentified_is_not_counted() {
        let mut cfg = config(1, Duration::from_secs(60), Duration::ZERO);
        cfg.identity = IdentityConfig {
            ip: Channel::Disabled,
            key: Channel::Custom(KeyOptions::default()),
        };
        let throttler = Throttler::new(&cfg).unwrap();
        let ctx = RequestContext::default();

        for _ in 0..3 {
            assert_eq!(
                throttler.check(&peer("192.0.2.1"), &ctx).unwrap(),
                Decision::Unidentified
            );
        }
        assert!(throttler.rate_limiter().is_empty().unwrap());
        assert_eq!(throttler.metrics().unidentified_requests, 3);
    }

    #[test]
    fn test_reset_admits_previously_blocked_identifier() {
        let throttler = Throttler::new(&config(
            1,
            Duration::from_secs(60),
            Duration::from_secs(600),
        ))
        .unwrap();
        let ctx = RequestContext::default();

        throttler.check(&peer("192.0.2.1"), &ctx).unwrap();
        assert!(matches!(
            throttler.check(&peer("192.0.2.1"), &ctx).unwrap(),
            Decision::RateLimited { .. }
        ));
        assert!(throttler.get_status("ip:192.0.2.1").unwrap().unwrap().is_blocked);

        throttler.reset().unwrap();

        assert_eq!(throttler.get_status("ip:192.0.2.1").unwrap(), None);
        assert!(matches!(
            throttler.check(&peer("192.0.2.1"), &ctx).unwrap(),
            Decision::Admitted { .. }
        ));
        assert_eq!(throttler.metrics().total_requests, 1);
    }
}
