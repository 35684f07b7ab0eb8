mod common;

use chrono::{TimeDelta, TimeZone, Utc};
use common::strategies::*;
use proptest::prelude::*;
use std::time::Duration;
use trigger_metrics::events::{AggregationPeriod, TimeRange, TriggerEvent, UNKNOWN};
use trigger_metrics::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use trigger_metrics::store::fields::rank_by_count;

proptest! {
    /// Property: the breaker opens exactly when `threshold` consecutive failures
    /// happen, and rejects everything afterwards until the reset timeout
    #[test]
    fn breaker_tracks_consecutive_failures(outcomes in outcomes_strategy(), threshold in 1u32..6) {
        let breaker = CircuitBreaker::new(
            "property".to_string(),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(3600),
            },
        );

        let mut consecutive = 0u32;
        let mut open = false;
        for success in outcomes {
            let result = futures::executor::block_on(breaker.call(|| async move {
                if success { Ok(()) } else { Err("boom") }
            }));

            if open {
                prop_assert!(result.is_err());
                continue;
            }
            if success {
                consecutive = 0;
                prop_assert!(result.is_ok());
            } else {
                consecutive += 1;
                open = consecutive >= threshold;
            }

            let expected = if open { CircuitState::Open } else { CircuitState::Closed };
            prop_assert_eq!(breaker.state(), expected);
            if !open {
                prop_assert_eq!(breaker.failure_count(), consecutive);
            }
        }
    }

    /// Property: ranking is by count descending, ties by name, and truncated
    #[test]
    fn ranking_is_ordered_and_bounded(entries in counts_strategy(), limit in 0usize..10) {
        let ranked = rank_by_count(entries.clone(), limit);

        prop_assert_eq!(ranked.len(), entries.len().min(limit));
        for pair in ranked.windows(2) {
            let (name_a, count_a) = &pair[0];
            let (name_b, count_b) = &pair[1];
            prop_assert!(count_a > count_b || (count_a == count_b && name_a < name_b));
        }
        // Nothing outranked is left out
        if let Some((_, lowest)) = ranked.last() {
            let better_missing = entries
                .iter()
                .filter(|entry| !ranked.contains(entry))
                .any(|(_, count)| count > lowest);
            prop_assert!(!better_missing);
        }
    }

    /// Property: bucket keys are unique, ascending and capped
    #[test]
    fn bucket_keys_are_sorted_and_capped(
        start_offset_hours in 0i64..2000,
        span_hours in 0i64..400,
        limit in 1usize..200,
        daily in any::<bool>(),
    ) {
        let origin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let start = origin + TimeDelta::hours(start_offset_hours);
        let period = if daily { AggregationPeriod::Day } else { AggregationPeriod::Hour };
        let range = TimeRange::new(start, start + TimeDelta::hours(span_hours), period);

        let keys = range.bucket_keys(limit);
        prop_assert!(!keys.is_empty());
        prop_assert!(keys.len() <= limit);
        for pair in keys.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        prop_assert_eq!(keys.last().cloned(), Some(period.bucket_key(range.end)));
    }

    /// Property: normalization always yields a writable event
    #[test]
    fn normalized_events_have_required_fields(
        bot in identifier_strategy(),
        condition in identifier_strategy(),
        user in identifier_strategy(),
        channel in identifier_strategy(),
        timestamp_ms in prop_oneof![Just(0i64), Just(-5i64), 1i64..4_000_000_000_000i64],
    ) {
        let now = Utc::now();
        let mut event = TriggerEvent::new(bot.clone(), condition, user, channel, "m1")
            .with_trigger_id("");
        event.timestamp_ms = timestamp_ms;
        event.normalize(now);

        prop_assert!(!event.trigger_id.is_empty());
        for field in [&event.bot_name, &event.condition_name, &event.user_id, &event.channel_id] {
            prop_assert!(!field.trim().is_empty());
        }
        if bot.trim().is_empty() {
            prop_assert_eq!(event.bot_name.as_str(), UNKNOWN);
        }
        prop_assert!(event.timestamp_ms > 0);
        prop_assert!(event.timestamp_ms <= (now + TimeDelta::days(1)).timestamp_millis());
    }
}
