//! Retry and backoff policy shared by every fetch worker

use crate::error::FetchError;
use rand::Rng;
use std::time::Duration;

/// Default number of attempts per task
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default exponential base
const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// Longest pause between two attempts
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Bounded attempts with exponential backoff between them.
///
/// The delay after failed attempt `n` (0-based) is `backoff_unit * backoff_base^n`,
/// optionally stretched by up to `jitter` of itself, and never longer than
/// [`MAX_BACKOFF`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_unit: Duration,
    /// Extra random fraction added to each delay, 0.0 disables jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_unit: Duration::from_secs(1),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: f64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            backoff_base: backoff_base.max(1.0),
            ..Self::default()
        }
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether a failure is worth another attempt
    pub fn should_retry(&self, error: &FetchError) -> bool {
        error.is_retryable()
    }

    /// Whether attempt `attempt` (0-based) is the last one allowed
    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        attempt + 1 >= self.max_retries
    }

    /// Deterministic delay after failed attempt `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff_unit.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.backoff_base.powi(attempt.min(i32::MAX as u32) as i32);
        capped(self.backoff_unit.as_secs_f64() * factor)
    }

    /// Delay with jitter applied
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        capped(delay.as_secs_f64() * (1.0 + extra))
    }
}

/// Seconds to a delay, saturating at [`MAX_BACKOFF`]. NaN saturates too.
fn capped(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .map(|delay| delay.min(MAX_BACKOFF))
        .unwrap_or(MAX_BACKOFF)
}
