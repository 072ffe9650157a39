use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::throttler::Throttler;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub tracked_identifiers: usize,
    pub sweeper_running: bool,
}

pub struct HealthChecker {
    throttler: Arc<Throttler>,
    started: Instant,
}

impl HealthChecker {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self {
            throttler,
            started: Instant::now(),
        }
    }

    pub fn check_health(&self) -> HealthStatus {
        let limiter = self.throttler.rate_limiter();
        let tracked = limiter.len();

        // A poisoned table means decisions are failing.
        let status = if tracked.is_ok() { "healthy" } else { "unhealthy" };

        HealthStatus {
            status: status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            tracked_identifiers: tracked.unwrap_or(0),
            sweeper_running: limiter.store().sweeper_running(),
        }
    }
}
