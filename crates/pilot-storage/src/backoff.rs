//! Retry schedule for dead-letter entries.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Exponents above this stop growing the delay (60s * 2^30 is already decades).
const MAX_EXPONENT: i64 = 30;

/// Exponential backoff with bounded positive jitter:
/// `delay = base * 2^retry_count + uniform(0, max_jitter_ratio) * that`.
///
/// With the defaults (60s base, 30% jitter) the unjittered series is
/// 1, 2, 4, 8, 16 minutes, and since `2 * base > 1.3 * base` the jittered
/// delays still strictly increase with the retry count.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay_secs: u64,
    pub max_jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_jitter_ratio: 0.3,
        }
    }
}

impl BackoffPolicy {
    /// Delay in whole seconds before retry number `retry_count + 1`.
    pub fn calculate_backoff(&self, retry_count: i64) -> i64 {
        let ratio = self.max_jitter_ratio.max(0.0);
        let jitter = rand::thread_rng().gen_range(0.0..=ratio);
        self.delay_with_jitter(retry_count, jitter)
    }

    pub fn unjittered_delay(&self, retry_count: i64) -> i64 {
        self.delay_with_jitter(retry_count, 0.0)
    }

    pub fn next_retry_at(&self, retry_count: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.calculate_backoff(retry_count))
    }

    fn delay_with_jitter(&self, retry_count: i64, jitter_fraction: f64) -> i64 {
        let exponent = retry_count.clamp(0, MAX_EXPONENT) as i32;
        let delay = self.base_delay_secs as f64 * 2f64.powi(exponent);
        (delay + delay * jitter_fraction).round() as i64
    }
}
