use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Quota applied to every identifier: `points` requests per fixed window of
/// `duration`, followed by an optional block of `block_duration` once the
/// window is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct QuotaConfig {
    #[validate(range(min = 1, message = "points must be greater than 0"))]
    pub points: u32,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Zero disables blocking; exhausted identifiers then wait for the window reset.
    #[serde(default, with = "humantime_serde")]
    pub block_duration: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            points: 100,
            duration: Duration::from_secs(60),
            block_duration: Duration::ZERO,
        }
    }
}

impl QuotaConfig {
    pub fn new(points: u32, duration: Duration, block_duration: Duration) -> Self {
        Self {
            points,
            duration,
            block_duration,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        saturating_millis(self.duration)
    }

    pub fn block_duration_ms(&self) -> u64 {
        saturating_millis(self.block_duration)
    }

    /// Blocks shorter than one millisecond cannot be represented and count as off.
    pub fn blocking_enabled(&self) -> bool {
        self.block_duration_ms() > 0
    }

    /// Validate quota parameters
    pub fn validate_quota(&self) -> Result<(), String> {
        if self.points == 0 {
            return Err("Quota points must be greater than 0".to_string());
        }
        if self.duration_ms() == 0 {
            return Err("Quota duration must be at least one millisecond".to_string());
        }
        if self.duration > MAX_DURATION {
            return Err("Quota duration is too large".to_string());
        }
        if !self.block_duration.is_zero() && self.block_duration_ms() == 0 {
            return Err(
                "Quota block duration must be zero or at least one millisecond".to_string(),
            );
        }
        if self.block_duration > MAX_DURATION {
            return Err("Quota block duration is too large".to_string());
        }
        Ok(())
    }
}

/// Upper bound for configured durations: ten years keeps every window
/// arithmetic on epoch milliseconds far from overflow.
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Milliseconds in `duration`, clamped to `u64::MAX` instead of wrapping.
pub fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
