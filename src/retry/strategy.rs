use crate::config::StoreConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Largest shift used by the exponential strategy, keeping `2^n - 1` inside `i32`.
pub const EXPONENT_LIMIT: u32 = i32::MAX.ilog2() - 1;

/// Maps a retry attempt number (starting at 1) to the delay before that attempt.
pub trait RetryDelayStrategy: Send + Sync {
    fn retry_delay(&self, attempt: u32) -> Duration;
}

/// Always waits the same amount of time.
#[derive(Debug, Clone)]
pub struct ConstantDelayStrategy {
    delay: Duration,
}

impl ConstantDelayStrategy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ConstantDelayStrategy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl RetryDelayStrategy for ConstantDelayStrategy {
    fn retry_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Randomized exponential backoff: `min(cap, multiplier * U[1, 2^n - 1))`.
///
/// The random factor keeps concurrent callers contending for the same
/// instance from retrying in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffStrategy {
    multiplier: Duration,
    cap: Duration,
}

impl ExponentialBackoffStrategy {
    pub fn new(multiplier: Duration, cap: Duration) -> Self {
        Self { multiplier, cap }
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl Default for ExponentialBackoffStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl RetryDelayStrategy for ExponentialBackoffStrategy {
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(EXPONENT_LIMIT);
        let upper = ((1u64 << exponent) - 1).max(2);
        let factor = rand::rng().random_range(1..upper);

        let multiplier_ms = self.multiplier.as_millis() as u64;
        let delay = Duration::from_millis(multiplier_ms.saturating_mul(factor));
        delay.min(self.cap)
    }
}

/// What to do when a load races another owner's instance lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstanceLockedRetryPolicy {
    /// Fail immediately with the contention error.
    #[default]
    NoRetry,
    /// Retry after a constant delay.
    BasicRetry,
    /// Retry with randomized exponential backoff.
    AggressiveRetry,
}

impl InstanceLockedRetryPolicy {
    /// `None` means the retry path must not be used at all.
    pub fn strategy(&self, config: &StoreConfig) -> Option<Arc<dyn RetryDelayStrategy>> {
        match self {
            InstanceLockedRetryPolicy::NoRetry => None,
            InstanceLockedRetryPolicy::BasicRetry => Some(Arc::new(ConstantDelayStrategy::new(
                Duration::from_millis(config.constant_retry_delay_ms),
            ))),
            InstanceLockedRetryPolicy::AggressiveRetry => {
                Some(Arc::new(ExponentialBackoffStrategy::new(
                    Duration::from_millis(config.backoff_multiplier_ms),
                    Duration::from_millis(config.backoff_cap_ms),
                )))
            }
        }
    }
}
