//! Backoff between attempts of a failed unit.
//!
//! The retry bound itself lives on each unit (`max_attempts`); this policy
//! only decides how long a retryable failure waits before it can be claimed
//! again.

use std::time::Duration;

use crate::config::WorkerSettings;

/// Delay policy for retryable failures.
#[derive(Debug, Clone, Default)]
pub enum RetryPolicy {
    /// Claimable again immediately.
    #[default]
    Immediate,

    /// Fixed delay between attempts.
    Fixed(Duration),

    /// Exponential backoff between attempts.
    Exponential {
        /// Delay after the first attempt (doubles each attempt).
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Exponential backoff starting at `initial_delay`, capped at `max_delay`.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::Exponential {
            initial_delay,
            max_delay,
        }
    }

    /// Create a fixed delay policy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed(delay)
    }

    /// Policy from `WORKER_RETRY_BASE` / `WORKER_RETRY_MAX`.
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::exponential(settings.retry_base, settings.retry_max)
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed(delay) => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
            } => {
                // 2^(attempt-1) * initial_delay, capped at max_delay
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial_delay
                    .checked_mul(multiplier)
                    .map_or(*max_delay, |d| d.min(*max_delay))
            }
        }
    }
}
