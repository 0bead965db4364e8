/// Property tests for ordering and eviction invariants.
///
/// The episodic log must hand back any range sorted by `(timestamp, id)`
/// with inclusive bounds regardless of insertion order; working memory and
/// the recall cache must respect their capacity bounds and eviction rules
/// under arbitrary operation sequences.
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use memoric::cache::{CacheConfig, RecallCache};
use memoric::prelude::*;
use memoric::working::{WorkingConfig, WorkingMemory};
use proptest::prelude::*;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn recall_range_is_sorted_and_complete(offsets in prop::collection::vec(-1000i64..1000, 1..40)) {
        let rt = runtime();
        rt.block_on(async {
            let engine = MemoryEngine::start().await.unwrap();
            let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

            for offset in &offsets {
                engine
                    .append(
                        ExperienceRecord::new(json!(offset))
                            .with_timestamp(base + ChronoDuration::seconds(*offset)),
                    )
                    .await
                    .unwrap();
            }

            let all = engine
                .recall_range(
                    base - ChronoDuration::seconds(1000),
                    base + ChronoDuration::seconds(1000),
                )
                .await;

            prop_assert_eq!(all.len(), offsets.len());
            for pair in all.windows(2) {
                prop_assert!(
                    (pair[0].timestamp, pair[0].id) < (pair[1].timestamp, pair[1].id)
                );
            }

            let mut expected = offsets.clone();
            expected.sort_unstable();
            let recalled: Vec<i64> = all
                .iter()
                .map(|r| (r.timestamp - base).num_seconds())
                .collect();
            prop_assert_eq!(recalled, expected);
            Ok(())
        })?;
    }

    #[test]
    fn recall_range_bounds_are_inclusive(
        offsets in prop::collection::vec(0i64..100, 1..30),
        lo in 0i64..100,
        span in 0i64..100,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let engine = MemoryEngine::start().await.unwrap();
            let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

            for offset in &offsets {
                engine
                    .append(
                        ExperienceRecord::new(json!(offset))
                            .with_timestamp(base + ChronoDuration::seconds(*offset)),
                    )
                    .await
                    .unwrap();
            }

            let hi = lo + span;
            let within = engine
                .recall_range(
                    base + ChronoDuration::seconds(lo),
                    base + ChronoDuration::seconds(hi),
                )
                .await;

            let expected = offsets.iter().filter(|o| lo <= **o && **o <= hi).count();
            prop_assert_eq!(within.len(), expected);
            for record in &within {
                let offset = (record.timestamp - base).num_seconds();
                prop_assert!(lo <= offset && offset <= hi);
            }
            Ok(())
        })?;
    }

    #[test]
    fn working_memory_never_exceeds_capacity(
        ops in prop::collection::vec((0u8..12, 0.0f64..1.0), 1..60),
    ) {
        let memory = WorkingMemory::with_config(WorkingConfig {
            capacity: 4,
            sweep_interval: None,
        });
        for (key, priority) in &ops {
            memory.set(format!("k{key}"), json!(*key), *priority, Duration::from_secs(3600));
            prop_assert!(memory.len() <= 4);
        }
    }

    #[test]
    fn working_memory_highest_priority_survives(
        extra in prop::collection::vec(0.0f64..0.9, 4..20),
    ) {
        let memory = WorkingMemory::with_config(WorkingConfig {
            capacity: 4,
            sweep_interval: None,
        });
        // The pinned item outranks everything inserted afterwards
        memory.set("pinned", json!("keep"), 1.0, Duration::from_secs(3600));
        for (i, priority) in extra.iter().enumerate() {
            memory.set(format!("k{i}"), json!(i), *priority, Duration::from_secs(3600));
        }
        prop_assert_eq!(memory.get("pinned"), Some(json!("keep")));
    }

    #[test]
    fn cache_respects_capacity_and_keeps_newest(
        keys in prop::collection::vec(0u8..16, 1..50),
    ) {
        let cache = RecallCache::with_config(CacheConfig {
            capacity: 8,
            default_ttl: None,
        });
        for key in &keys {
            cache.put(format!("k{key}"), json!(*key), None);
            prop_assert!(cache.len() <= 8);
        }
        let newest = format!("k{}", keys[keys.len() - 1]);
        prop_assert_eq!(cache.get(&newest), Some(json!(keys[keys.len() - 1])));
    }
}
