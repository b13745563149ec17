//! Shared proptest generators.
//!
//! This module provides reusable generators for status codes, URLs and
//! policy settings used across the pipeline tests.

use std::time::Duration;

use proptest::prelude::*;
use reqwest::StatusCode;
use url::Url;

fn status_in(codes: std::ops::RangeInclusive<u16>) -> impl Strategy<Value = StatusCode> {
    codes.prop_filter_map("valid status code", |c| StatusCode::from_u16(c).ok())
}

/// Generate 2xx status codes.
pub fn success_status_strategy() -> impl Strategy<Value = StatusCode> {
    status_in(200..=299)
}

/// Generate 3xx, 4xx and 5xx status codes.
pub fn non_success_status_strategy() -> impl Strategy<Value = StatusCode> {
    status_in(300..=599)
}

/// Generate statuses counted as transient: 5xx and 408.
pub fn transient_status_strategy() -> impl Strategy<Value = StatusCode> {
    prop_oneof![
        4 => status_in(500..=599),
        1 => Just(StatusCode::REQUEST_TIMEOUT),
    ]
}

/// Generate 4xx statuses other than 408.
pub fn client_error_status_strategy() -> impl Strategy<Value = StatusCode> {
    status_in(400..=499).prop_filter("408 is transient", |s| *s != StatusCode::REQUEST_TIMEOUT)
}

/// Generate host names.
pub fn host_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("localhost".to_string()),
        "[a-z][a-z0-9-]{2,15}(\\.[a-z]{2,6}){0,2}",
    ]
}

/// Generate URLs with an optional explicit port and a path.
pub fn url_strategy() -> impl Strategy<Value = Url> {
    (
        prop_oneof![Just("http"), Just("https")],
        host_strategy(),
        proptest::option::of(1024u16..65535),
        "(/[a-zA-Z0-9]{1,10}){0,4}",
    )
        .prop_filter_map("parsable URL", |(scheme, host, port, path)| {
            let authority = port.map_or_else(|| host.clone(), |p| format!("{host}:{p}"));
            Url::parse(&format!("{scheme}://{authority}{path}")).ok()
        })
}

/// Generate valid service names.
pub fn service_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{2,20}"
}

/// Generate retry counts.
pub fn retry_count_strategy() -> impl Strategy<Value = u32> {
    0u32..6
}

/// Generate circuit breaker thresholds.
pub fn failure_threshold_strategy() -> impl Strategy<Value = u32> {
    1u32..10
}

/// Generate backoff base delays (10ms to 2s).
pub fn base_delay_strategy() -> impl Strategy<Value = Duration> {
    (10u64..2000).prop_map(Duration::from_millis)
}
