// src/core/power/tokens.rs

//! The rate-limit primitive for suspend and resume operations.

use std::time::Duration;
use tracing::error;

/// A token bucket refilled on a fixed cadence. One bucket exists per
/// direction (suspend, resume); a rate of zero means unlimited and no
/// bucket is built at all.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    max_tokens: i64,
    refill_count: i64,
    refill_period_ms: u64,
    last_period: u64,
    tokens: i64,
}

impl TokenBucket {
    /// Builds a bucket for `rate` operations per minute, bursting up to the
    /// amount a full loop interval could accumulate.
    pub fn new(rate: u32, effective_max_interval: Duration, now_ms: u64) -> Option<Self> {
        if rate == 0 {
            return None;
        }
        let max_tokens = ((rate as u64 * effective_max_interval.as_secs()) / 60).max(1) as i64;
        let refill_period_ms = 60_000 / rate as u64;
        Some(Self {
            max_tokens,
            refill_count: 1,
            refill_period_ms,
            last_period: now_ms / refill_period_ms,
            tokens: 0,
        })
    }

    /// Adds the tokens accumulated since the last update, saturating at the
    /// bucket size.
    pub fn update(&mut self, now_ms: u64) {
        let period = now_ms / self.refill_period_ms;
        if period > self.last_period {
            let earned = (period - self.last_period) as i64 * self.refill_count;
            self.tokens = (self.tokens + earned).min(self.max_tokens);
            self.last_period = period;
        }
    }

    /// Spends one token if available.
    pub fn try_spend(&mut self) -> bool {
        if self.tokens < 0 {
            // A negative balance means some caller bypassed try_spend.
            error!("token bucket balance is negative ({}); resetting", self.tokens);
            self.tokens = 0;
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    pub fn max_tokens(&self) -> i64 {
        self.max_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_and_refills_per_period() {
        // 60/min with a 10s interval: one token per second, burst of 10.
        let mut bucket = TokenBucket::new(60, Duration::from_secs(10), 0).unwrap();
        assert_eq!(bucket.max_tokens(), 10);
        assert!(!bucket.try_spend());

        bucket.update(1_000);
        assert!(bucket.try_spend());
        assert!(!bucket.try_spend());

        bucket.update(4_000);
        assert_eq!(bucket.tokens(), 3);
    }

    #[test]
    fn refill_saturates_at_max() {
        let mut bucket = TokenBucket::new(60, Duration::from_secs(10), 0).unwrap();
        bucket.update(3_600_000);
        assert_eq!(bucket.tokens(), bucket.max_tokens());
    }

    #[test]
    fn zero_rate_means_no_bucket() {
        assert!(TokenBucket::new(0, Duration::from_secs(10), 0).is_none());
    }

    #[test]
    fn burst_is_at_least_one() {
        let bucket = TokenBucket::new(1, Duration::from_secs(10), 0).unwrap();
        assert_eq!(bucket.max_tokens(), 1);
    }
}
