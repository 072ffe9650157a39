use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::ThrottlerResult;
use crate::rate_limit_config::QuotaConfig;
use crate::storage::{BoundedStore, RateLimitEntry};

/// Result of a single `consume` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub remaining: u32,
    /// When the caller may expect quota again, in ms since the epoch.
    pub reset_at: u64,
}

impl ConsumeOutcome {
    fn allowed(remaining: u32, reset_at: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
        }
    }

    fn denied(reset_at: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
        }
    }
}

/// Read-only view of an identifier's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub remaining_points: u32,
    pub reset_at: u64,
    pub is_blocked: bool,
}

/// Fixed-window rate limit engine with an optional block window.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<BoundedStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(max_size: usize) -> Self {
        Self::with_clock(max_size, Arc::new(SystemClock))
    }

    pub fn with_clock(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(BoundedStore::new(max_size)),
            clock,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn store(&self) -> &BoundedStore {
        &self.store
    }

    /// Consume one point for `identifier` at the current clock time.
    pub fn consume(&self, identifier: &str, quota: &QuotaConfig) -> ThrottlerResult<ConsumeOutcome> {
        self.consume_at(identifier, quota, self.clock.now_ms())
    }

    /// Consume one point for `identifier` at `now` (ms since the epoch).
    ///
    /// The table lock is held for the whole transition so two concurrent
    /// callers can never both observe the last remaining point.
    pub fn consume_at(
        &self,
        identifier: &str,
        quota: &QuotaConfig,
        now: u64,
    ) -> ThrottlerResult<ConsumeOutcome> {
        let mut table = self.store.lock()?;

        let entry = match table.get_mut(identifier) {
            // An active block wins over window rollover.
            Some(entry) if entry.is_blocked_at(now) => {
                let until = entry.blocked_until.unwrap_or(now);
                return Ok(ConsumeOutcome::denied(until));
            }
            Some(entry) if !entry.window_expired_at(now) => entry,
            _ => {
                let remaining = quota.points.saturating_sub(1);
                let reset_at = now.saturating_add(quota.duration_ms());
                table.insert(RateLimitEntry::fresh(identifier, remaining, reset_at));
                debug!(
                    target: "throttler::rate_limiter",
                    identifier = %identifier,
                    remaining,
                    reset_at,
                    "Started new window"
                );
                return Ok(ConsumeOutcome::allowed(remaining, reset_at));
            }
        };

        // A block that has run out is cleared and the counter re-evaluated below;
        // a still-exhausted counter re-arms a new block straight away.
        if entry.blocked_until.is_some() {
            entry.blocked_until = None;
        }

        if entry.remaining_points == 0 {
            if quota.blocking_enabled() {
                let until = now.saturating_add(quota.block_duration_ms());
                entry.blocked_until = Some(until);
                debug!(
                    target: "throttler::rate_limiter",
                    identifier = %identifier,
                    blocked_until = until,
                    "Quota exhausted, identifier blocked"
                );
                return Ok(ConsumeOutcome::denied(until));
            }
            return Ok(ConsumeOutcome::denied(entry.window_reset_at));
        }

        entry.remaining_points -= 1;
        Ok(ConsumeOutcome::allowed(
            entry.remaining_points,
            entry.window_reset_at,
        ))
    }

    /// Snapshot of `identifier` at the current clock time.
    pub fn get_status(&self, identifier: &str) -> ThrottlerResult<Option<StatusSnapshot>> {
        self.get_status_at(identifier, self.clock.now_ms())
    }

    /// Snapshot of `identifier` at `now`. Never mutates the entry.
    pub fn get_status_at(&self, identifier: &str, now: u64) -> ThrottlerResult<Option<StatusSnapshot>> {
        let table = self.store.lock()?;

        let snapshot = table.get(identifier).and_then(|entry| {
            let is_blocked = entry.is_blocked_at(now);
            if entry.window_expired_at(now) && !is_blocked {
                return None;
            }
            let reset_at = match entry.blocked_until {
                Some(until) if is_blocked => until,
                _ => entry.window_reset_at,
            };
            Some(StatusSnapshot {
                remaining_points: entry.remaining_points,
                reset_at,
                is_blocked,
            })
        });

        Ok(snapshot)
    }

    /// Remove the accounting for a single identifier.
    pub fn delete(&self, identifier: &str) -> ThrottlerResult<bool> {
        Ok(self.store.lock()?.remove(identifier).is_some())
    }

    /// Clear all accounting, active blocks included.
    pub fn reset(&self) -> ThrottlerResult<()> {
        self.store.reset()
    }

    pub fn len(&self) -> ThrottlerResult<usize> {
        self.store.len()
    }

    pub fn is_empty(&self) -> ThrottlerResult<bool> {
        self.store.is_empty()
    }

    /// Start the periodic sweep of expired entries. Requires a tokio runtime.
    pub fn start_cleanup(&self, interval: Duration) -> ThrottlerResult<()> {
        self.store.start_sweeper(interval, self.clock())
    }

    /// Run one sweep pass now; returns the number of entries reclaimed.
    pub fn cleanup_expired(&self) -> ThrottlerResult<usize> {
        self.store.sweep(self.clock.now_ms())
    }

    pub fn destroy(&self) -> ThrottlerResult<()> {
        self.store.destroy()
    }
}
