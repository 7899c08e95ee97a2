// tests/property/rate_bound_test.rs

//! The power-save rate bound: over any window of at least one refill
//! period, spends never exceed the refill earnings plus one full burst.

use lodestar::core::power::TokenBucket;
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn spend_rate_is_bounded(
        rate in 1u32..240,
        interval_secs in 1u64..120,
        steps in prop::collection::vec((1u64..5_000, 1u32..20), 1..100)
    ) {
        let interval = Duration::from_secs(interval_secs);
        let mut bucket = TokenBucket::new(rate, interval, 0).unwrap();
        let max_tokens = bucket.max_tokens();

        let mut now_ms = 0u64;
        let mut spent = 0u64;
        for (advance_ms, attempts) in steps {
            now_ms += advance_ms;
            bucket.update(now_ms);
            for _ in 0..attempts {
                if bucket.try_spend() {
                    spent += 1;
                }
            }
        }

        // Over the whole window W, wakes <= ceil(W / 60000) * rate + burst.
        let window_minutes = now_ms.div_ceil(60_000);
        let bound = window_minutes * rate as u64 + max_tokens as u64;
        prop_assert!(
            spent <= bound,
            "spent {spent} > bound {bound} (window {now_ms}ms, rate {rate}/min)"
        );
    }

    // The bucket never goes negative and never exceeds its burst size.
    #[test]
    fn balance_stays_in_range(
        rate in 1u32..120,
        events in prop::collection::vec((0u64..10_000, prop::bool::ANY), 1..200)
    ) {
        let mut bucket = TokenBucket::new(rate, Duration::from_secs(30), 0).unwrap();
        let mut now_ms = 0u64;
        for (advance_ms, spend) in events {
            now_ms += advance_ms;
            bucket.update(now_ms);
            if spend {
                let _ = bucket.try_spend();
            }
            prop_assert!(bucket.tokens() >= 0);
            prop_assert!(bucket.tokens() <= bucket.max_tokens());
        }
    }
}
