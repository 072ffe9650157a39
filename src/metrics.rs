use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of guard decisions since start or the last reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleMetrics {
    pub total_requests: u64,
    pub admitted_requests: u64,
    pub throttled_requests: u64,
    pub blocked_requests: u64,
    pub bypassed_requests: u64,
    pub unidentified_requests: u64,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    admitted: AtomicU64,
    throttled: AtomicU64,
    blocked: AtomicU64,
    bypassed: AtomicU64,
    unidentified: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypassed(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unidentified(&self) {
        self.unidentified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ThrottleMetrics {
        let admitted_requests = self.admitted.load(Ordering::Relaxed);
        let throttled_requests = self.throttled.load(Ordering::Relaxed);
        let blocked_requests = self.blocked.load(Ordering::Relaxed);
        let bypassed_requests = self.bypassed.load(Ordering::Relaxed);
        let unidentified_requests = self.unidentified.load(Ordering::Relaxed);

        ThrottleMetrics {
            total_requests: admitted_requests
                + throttled_requests
                + blocked_requests
                + bypassed_requests
                + unidentified_requests,
            admitted_requests,
            throttled_requests,
            blocked_requests,
            bypassed_requests,
            unidentified_requests,
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.admitted,
            &self.throttled,
            &self.blocked,
            &self.bypassed,
            &self.unidentified,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
