//! Global request pacing.
//!
//! Every request waits for a slot. Consecutive slots are spaced by an interval
//! drawn uniformly from `[min, max]`; after failures both bounds grow
//! geometrically until a success resets them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Factor applied to both bounds per consecutive failure.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Failures beyond this count stop growing the bounds.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: u32,
}

fn default_min_interval_ms() -> u64 {
    1_000
}

fn default_max_interval_ms() -> u64 {
    3_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_cap() -> u32 {
    5
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.min_interval_ms > self.max_interval_ms {
            return Err(crate::Error::config(format!(
                "rate_limiter.min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(crate::Error::config(format!(
                "rate_limiter.backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    /// Start time of the most recently reserved request.
    last_slot: Option<Instant>,
    consecutive_failures: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Wait for the next request slot. Returns how long the caller slept.
    ///
    /// The slot is reserved under the lock and the sleep happens outside it,
    /// so dropping the future never leaves the limiter locked.
    pub async fn wait(&self) -> Duration {
        let slot = {
            let mut state = self.state.lock();
            let (min, max) = self.bounds_for(state.consecutive_failures);
            let interval = sample(min, max);
            let now = Instant::now();
            let slot = match state.last_slot {
                Some(last) => (last + interval).max(now),
                None => now,
            };
            state.last_slot = Some(slot);
            slot
        };

        let delay = slot.saturating_duration_since(Instant::now());
        if !delay.is_zero() {
            trace!("Rate limited, waiting {:?}", delay);
            tokio::time::sleep_until(slot).await;
        }
        delay
    }

    pub fn report_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        debug!(
            failures = state.consecutive_failures,
            "Rate limiter backing off"
        );
    }

    pub fn report_success(&self) {
        let mut state = self.state.lock();
        if state.consecutive_failures > 0 {
            debug!("Rate limiter back to base pacing");
        }
        state.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Current `(min, max)` spacing.
    pub fn effective_bounds(&self) -> (Duration, Duration) {
        self.bounds_for(self.state.lock().consecutive_failures)
    }

    fn bounds_for(&self, failures: u32) -> (Duration, Duration) {
        let factor = if failures == 0 {
            1.0
        } else {
            self.config
                .backoff_multiplier
                .powi(failures.min(self.config.backoff_cap) as i32)
        };
        let scale =
            |ms: u64| Duration::from_nanos((ms as f64 * 1_000_000.0 * factor).round() as u64);
        (
            scale(self.config.min_interval_ms),
            scale(self.config.max_interval_ms),
        )
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

fn sample(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    min + (max - min).mul_f64(rand::random::<f64>())
}
