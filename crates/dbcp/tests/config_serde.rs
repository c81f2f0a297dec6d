//! Serde tests for configuration types.

#![cfg(feature = "serde")]

use std::time::Duration;

use dbcp::{PoolConfig, ReducerConfig};
use proptest::prelude::*;

#[test]
fn partial_config_fills_defaults() {
    let config: PoolConfig = serde_json::from_str(
        r#"{
            "name": "orders",
            "statement_cache_max_size": 64,
            "reducer": { "samples": 10 }
        }"#,
    )
    .unwrap();

    assert_eq!(config.name, "orders");
    assert_eq!(config.statement_cache_max_size, 64);
    assert_eq!(config.max_size, 10);
    assert_eq!(config.log_query_execution_longer_than_ms, 3000);
    assert_eq!(config.reducer.samples, 10);
    assert_eq!(config.reducer.time_interval, Duration::from_secs(60));
    assert!(config.reducer.enabled);
    config.validate().unwrap();
}

#[test]
fn negative_log_threshold_deserializes() {
    let config: PoolConfig =
        serde_json::from_str(r#"{ "log_query_execution_longer_than_ms": -1 }"#).unwrap();
    assert_eq!(config.log_query_execution_longer_than_ms, -1);
}

#[test]
fn invalid_values_are_caught_by_validate() {
    let config: PoolConfig = serde_json::from_str(r#"{ "reducer": { "samples": 0 } }"#).unwrap();
    assert!(config.validate().is_err());
}

fn arb_reducer() -> impl Strategy<Value = ReducerConfig> {
    (any::<bool>(), 1u64..3600, 1u32..100).prop_map(|(enabled, secs, samples)| ReducerConfig {
        enabled,
        time_interval: Duration::from_secs(secs),
        samples,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn pool_config_json_roundtrip(
        name in "[a-z]{1,12}",
        initial_size in 0usize..10,
        extra in 0usize..10,
        cache in 0usize..256,
        threshold in -1i64..10_000,
        stack_trace in any::<bool>(),
        reducer in arb_reducer(),
    ) {
        let config = PoolConfig {
            name,
            initial_size,
            max_size: initial_size + extra + 1,
            acquire_timeout: Duration::from_millis(500),
            statement_cache_max_size: cache,
            log_query_execution_longer_than_ms: threshold,
            log_stack_trace_for_long_query_execution: stack_trace,
            reducer,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&json).unwrap();

        prop_assert_eq!(&back.name, &config.name);
        prop_assert_eq!(back.max_size, config.max_size);
        prop_assert_eq!(back.statement_cache_max_size, config.statement_cache_max_size);
        prop_assert_eq!(back.log_query_execution_longer_than_ms, threshold);
        prop_assert_eq!(&back.reducer, &config.reducer);
        prop_assert!(back.validate().is_ok());
    }
}
