//! Bounded in-memory storage for rate limit entries.
//!
//! Entries live in a `HashMap` keyed by identifier, mirrored by a `BTreeSet`
//! ordered on `(window_reset_at, identifier)`. The index gives the eviction
//! victim (smallest reset time) and the expired prefix for the sweep without
//! scanning the whole table.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{ThrottlerError, ThrottlerResult};

/// Quota and block state tracked for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitEntry {
    pub identifier: String,
    pub remaining_points: u32,
    /// Exclusive end of the current window, in ms since the epoch.
    pub window_reset_at: u64,
    pub blocked_until: Option<u64>,
}

impl RateLimitEntry {
    pub fn fresh(identifier: &str, remaining_points: u32, window_reset_at: u64) -> Self {
        Self {
            identifier: identifier.to_string(),
            remaining_points,
            window_reset_at,
            blocked_until: None,
        }
    }

    pub fn is_blocked_at(&self, now: u64) -> bool {
        matches!(self.blocked_until, Some(until) if until > now)
    }

    pub fn window_expired_at(&self, now: u64) -> bool {
        self.window_reset_at <= now
    }

    /// An entry the sweep may reclaim: window over and no block still running.
    pub fn is_reclaimable_at(&self, now: u64) -> bool {
        self.window_expired_at(now) && !self.is_blocked_at(now)
    }
}

/// The capacity-limited table. Callers hold the surrounding lock for the
/// whole read-modify-write of a decision.
#[derive(Debug)]
pub struct EntryTable {
    entries: HashMap<String, RateLimitEntry>,
    by_reset: BTreeSet<(u64, String)>,
    max_size: usize,
}

impl EntryTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_reset: BTreeSet::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn get(&self, identifier: &str) -> Option<&RateLimitEntry> {
        self.entries.get(identifier)
    }

    /// Mutable access for in-place transitions. `window_reset_at` must not be
    /// changed through this reference; use [`EntryTable::insert`] for a new window.
    pub fn get_mut(&mut self, identifier: &str) -> Option<&mut RateLimitEntry> {
        self.entries.get_mut(identifier)
    }

    /// Insert or replace an entry. A brand-new identifier arriving at capacity
    /// first evicts the entry with the earliest window reset.
    pub fn insert(&mut self, entry: RateLimitEntry) -> Option<RateLimitEntry> {
        if let Some(previous) = self.entries.get(&entry.identifier) {
            self.by_reset
                .remove(&(previous.window_reset_at, previous.identifier.clone()));
        } else if self.entries.len() >= self.max_size {
            self.evict_earliest();
        }

        self.by_reset
            .insert((entry.window_reset_at, entry.identifier.clone()));
        self.entries.insert(entry.identifier.clone(), entry)
    }

    pub fn remove(&mut self, identifier: &str) -> Option<RateLimitEntry> {
        let entry = self.entries.remove(identifier)?;
        self.by_reset
            .remove(&(entry.window_reset_at, entry.identifier.clone()));
        Some(entry)
    }

    fn evict_earliest(&mut self) -> Option<RateLimitEntry> {
        let (_, identifier) = self.by_reset.pop_first()?;
        let evicted = self.entries.remove(&identifier);
        debug!(
            target: "throttler::storage",
            identifier = %identifier,
            "Evicted entry at capacity"
        );
        evicted
    }

    /// Remove every entry whose window has ended and that is not actively
    /// blocked. Returns the number of entries removed.
    pub fn sweep(&mut self, now: u64) -> usize {
        let candidates: Vec<(u64, String)> = self
            .by_reset
            .iter()
            .take_while(|(reset_at, _)| *reset_at <= now)
            .filter(|(_, identifier)| {
                self.entries
                    .get(identifier)
                    .map_or(true, |entry| entry.is_reclaimable_at(now))
            })
            .cloned()
            .collect();

        for key in &candidates {
            self.by_reset.remove(key);
            self.entries.remove(&key.1);
        }

        candidates.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_reset.clear();
    }
}

/// Shared table plus the lifecycle of its periodic sweep.
pub struct BoundedStore {
    table: Arc<Mutex<EntryTable>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BoundedStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(EntryTable::new(max_size))),
            sweeper: Mutex::new(None),
        }
    }

    /// Lock the table for a read-modify-write.
    pub fn lock(&self) -> ThrottlerResult<MutexGuard<'_, EntryTable>> {
        self.table.lock().map_err(|_| {
            ThrottlerError::InternalError("Failed to acquire lock on rate limit table".to_string())
        })
    }

    pub fn len(&self) -> ThrottlerResult<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> ThrottlerResult<bool> {
        Ok(self.lock()?.is_empty())
    }

    pub fn sweep(&self, now: u64) -> ThrottlerResult<usize> {
        Ok(self.lock()?.sweep(now))
    }

    pub fn reset(&self) -> ThrottlerResult<()> {
        self.lock()?.clear();
        Ok(())
    }

    /// Spawn the periodic sweep on the current tokio runtime. The first pass
    /// runs one `interval` after the call. Calling this again replaces the
    /// running sweeper.
    pub fn start_sweeper(&self, interval: Duration, clock: Arc<dyn Clock>) -> ThrottlerResult<()> {
        let table = Arc::clone(&self.table);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let now = clock.now_ms();
                match table.lock() {
                    Ok(mut table) => {
                        let removed = table.sweep(now);
                        if removed > 0 {
                            debug!(
                                target: "throttler::storage",
                                removed,
                                remaining = table.len(),
                                "Sweep reclaimed expired entries"
                            );
                        }
                    }
                    Err(_) => {
                        warn!(target: "throttler::storage", "Sweep skipped: table lock poisoned");
                    }
                }
            }
        });

        let mut sweeper = self.sweeper.lock().map_err(|_| {
            ThrottlerError::InternalError("Failed to acquire lock on sweeper handle".to_string())
        })?;
        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .map(|sweeper| sweeper.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the sweep and drop every entry.
    pub fn destroy(&self) -> ThrottlerResult<()> {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        self.reset()
    }
}

impl Drop for BoundedStore {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn entry(id: &str, remaining: u32, reset_at: u64) -> RateLimitEntry {
        RateLimitEntry::fresh(id, remaining, reset_at)
    }

    #[test]
    fn test_eviction_removes_earliest_reset() {
        let mut table = EntryTable::new(2);
        table.insert(entry("ip:1", 1, 1_000));
        table.insert(entry("ip:2", 1, 2_000));
        table.insert(entry("ip:3", 1, 3_000));

        assert_eq!(table.len(), 2);
        assert!(table.get("ip:1").is_none());
        assert!(table.get("ip:2").is_some());
        assert!(table.get("ip:3").is_some());
    }

    #[test]
    fn test_replacing_existing_identifier_never_evicts() {
        let mut table = EntryTable::new(2);
        table.insert(entry("ip:1", 1, 1_000));
        table.insert(entry("ip:2", 1, 2_000));
        table.insert(entry("ip:1", 5, 9_000));

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("ip:1").unwrap().window_reset_at, 9_000);
        assert!(table.get("ip:2").is_some());

        // The stale index slot for ip:1 must be gone, so ip:2 is the next victim.
        table.insert(entry("ip:3", 1, 10_000));
        assert!(table.get("ip:2").is_none());
        assert!(table.get("ip:1").is_some());
    }

    #[test]
    fn test_sweep_keeps_active_and_blocked_entries() {
        let mut table = EntryTable::new(10);
        table.insert(entry("expired", 0, 1_000));
        table.insert(entry("active", 3, 5_000));
        let mut blocked = entry("blocked", 0, 1_000);
        blocked.blocked_until = Some(4_000);
        table.insert(blocked);
        let mut block_over = entry("block-over", 0, 1_000);
        block_over.blocked_until = Some(1_500);
        table.insert(block_over);

        let removed = table.sweep(2_000);

        assert_eq!(removed, 2);
        assert!(table.get("expired").is_none());
        assert!(table.get("block-over").is_none());
        assert!(table.get("active").is_some());
        assert!(table.get("blocked").is_some());
    }

    #[test]
    fn test_sweep_boundary_is_inclusive() {
        let mut table = EntryTable::new(10);
        table.insert(entry("edge", 1, 2_000));
        assert_eq!(table.sweep(1_999), 0);
        assert_eq!(table.sweep(2_000), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut table = EntryTable::new(4);
        table.insert(entry("a", 1, 1_000));
        table.insert(entry("b", 1, 2_000));

        assert!(table.remove("a").is_some());
        assert!(table.remove("a").is_none());
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.sweep(u64::MAX), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let clock = ManualClock::new(0);
        let store = BoundedStore::new(10);
        store.lock().unwrap().insert(entry("ip:1", 0, 1_000));

        store
            .start_sweeper(Duration::from_secs(5), Arc::new(clock.clone()))
            .unwrap();
        assert!(store.sweeper_running());

        clock.set(2_000);
        tokio::time::sleep(Duration::from_millis(5_100)).await;

        assert_eq!(store.len().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_sweeper_and_clears() {
        let clock = ManualClock::new(0);
        let store = BoundedStore::new(10);
        store
            .start_sweeper(Duration::from_secs(1), Arc::new(clock))
            .unwrap();
        store.lock().unwrap().insert(entry("ip:1", 1, 60_000));

        store.destroy().unwrap();
        tokio::task::yield_now().await;

        assert!(!store.sweeper_running());
        assert!(store.is_empty().unwrap());
    }
}
