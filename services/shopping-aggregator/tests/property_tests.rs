//! Property-based tests for configuration and health aggregation.

use std::time::Duration;

use proptest::prelude::*;
use shopping_aggregator::health::format_duration;
use shopping_aggregator::{Config, ConfigError, HealthStatus, ServiceClients};
use test_utils::fixtures;
use test_utils::generators::{failure_threshold_strategy, retry_count_strategy};

fn status_strategy() -> impl Strategy<Value = HealthStatus> {
    prop_oneof![
        Just(HealthStatus::Healthy),
        Just(HealthStatus::Degraded),
        Just(HealthStatus::Unhealthy),
    ]
}

fn load(vars: Vec<(&'static str, String)>) -> Result<Config, ConfigError> {
    Config::from_source(move |name| vars.iter().find(|(key, _)| *key == name).map(|(_, value)| value.clone()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_resilience_settings_flow_into_policies(
        retries in retry_count_strategy(),
        threshold in failure_threshold_strategy(),
        break_secs in 1u64..120,
        port in 1u16..,
    ) {
        let config = load(vec![
            ("RETRY_COUNT", retries.to_string()),
            ("CB_FAILURE_THRESHOLD", threshold.to_string()),
            ("CB_BREAK_DURATION", break_secs.to_string()),
            ("PORT", port.to_string()),
        ])
        .unwrap();

        prop_assert_eq!(config.retry_policy("catalog").max_retries(), retries);
        let breaker = config.circuit_breaker_config();
        prop_assert_eq!(breaker.failure_threshold, threshold);
        prop_assert_eq!(breaker.break_duration, Duration::from_secs(break_secs));
        let port_suffix = format!(":{port}");
        prop_assert!(config.bind_address().ends_with(&port_suffix));
    }

    #[test]
    fn prop_non_numeric_settings_rejected(value in "[a-z]{1,8}") {
        let rejected = matches!(load(vec![("RETRY_COUNT", value)]), Err(ConfigError::ParseError { .. }));
        prop_assert!(rejected);
    }

    #[test]
    fn prop_worst_status_dominates(statuses in prop::collection::vec(status_strategy(), 0..8)) {
        let worst = HealthStatus::worst(statuses.clone());
        prop_assert!(statuses.iter().all(|s| *s <= worst));
        let unavailable = worst.http_status() == axum::http::StatusCode::SERVICE_UNAVAILABLE;
        prop_assert_eq!(unavailable, statuses.contains(&HealthStatus::Unhealthy));
    }

    #[test]
    fn prop_duration_format_shape(millis in 0u64..360_000_000) {
        let formatted = format_duration(Duration::from_millis(millis));
        let (clock, fraction) = formatted.split_once('.').unwrap();
        prop_assert_eq!(fraction.len(), 7);
        let parts: Vec<u64> = clock.split(':').map(|p| p.parse().unwrap()).collect();
        prop_assert_eq!(parts.len(), 3);
        prop_assert!(parts[1] < 60 && parts[2] < 60);
        prop_assert_eq!(parts[0] * 3600 + parts[1] * 60 + parts[2], millis / 1000);
    }

    #[test]
    fn prop_clients_keep_base_path(prefix in "[a-z]{1,10}(/[a-z]{1,10}){0,2}") {
        let base = format!("http://gateway:8010/{prefix}");
        let config = load(vec![("BASKET_URL", base.clone())]).unwrap();
        let clients = ServiceClients::with_transport(
            &config,
            &fixtures::logging_context(),
            test_utils::MockTransport::new(),
        );

        let url = clients.basket.url("/swagger/index.html").unwrap();
        prop_assert_eq!(url.as_str(), format!("{base}/swagger/index.html"));
    }
}
