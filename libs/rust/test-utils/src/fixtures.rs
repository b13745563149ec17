//! Test fixtures with sample data.
//!
//! This module provides pre-built requests, contexts and addresses for use
//! in tests.

use std::net::TcpListener;

use outbound_pipeline::{LoggingConfig, LoggingContext, OutboundRequest, PipelineBuilder};
use url::Url;

/// Catalog base address used in tests.
pub const CATALOG_URL: &str = "http://localhost:8000";
/// Basket base address used in tests.
pub const BASKET_URL: &str = "http://localhost:8001";
/// Ordering base address used in tests.
pub const ORDERING_URL: &str = "http://localhost:8004";

/// Parse a URL that is known to be valid.
///
/// # Panics
///
/// Panics if `url` does not parse.
#[must_use]
#[allow(clippy::expect_used)]
pub fn url(url: &str) -> Url {
    Url::parse(url).expect("fixture URL must parse")
}

/// Logging context without a sink.
///
/// # Panics
///
/// Panics if the context cannot be built.
#[must_use]
#[allow(clippy::expect_used)]
pub fn logging_context() -> LoggingContext {
    let config = LoggingConfig::default()
        .with_application("Shopping.Aggregator")
        .with_environment("Test")
        .with_machine_name("test-host");
    LoggingContext::new(&config).expect("logging context without a sink")
}

/// `GET /api/v1/Catalog` on the catalog service.
#[must_use]
pub fn catalog_request() -> OutboundRequest {
    OutboundRequest::get(url(&format!("{CATALOG_URL}/api/v1/Catalog"))).with_operation_key("GetCatalog")
}

/// `GET /api/v1/Basket/{user}` on the basket service.
#[must_use]
pub fn basket_request(user: &str) -> OutboundRequest {
    OutboundRequest::get(url(&format!("{BASKET_URL}/api/v1/Basket/{user}"))).with_operation_key("GetBasket")
}

/// `GET /api/v1/Order/{user}` on the ordering service.
#[must_use]
pub fn ordering_request(user: &str) -> OutboundRequest {
    OutboundRequest::get(url(&format!("{ORDERING_URL}/api/v1/Order/{user}")))
        .with_operation_key("GetOrdersByUserName")
}

/// Builder for a client named `name`, logging through [`logging_context`].
#[must_use]
pub fn builder(name: &str, base: &str) -> PipelineBuilder {
    PipelineBuilder::new(name, url(base), &logging_context())
}

/// An address on the loopback interface with nothing listening.
///
/// # Panics
///
/// Panics if no ephemeral port can be bound.
#[must_use]
#[allow(clippy::expect_used)]
pub fn refused_url() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local address").port();
    drop(listener);
    url(&format!("http://127.0.0.1:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_requests() {
        assert_eq!(catalog_request().authority(), "localhost:8000");
        assert_eq!(basket_request("swn").url().path(), "/api/v1/Basket/swn");
        assert_eq!(ordering_request("swn").operation_key(), Some("GetOrdersByUserName"));
    }

    #[test]
    fn test_refused_url_has_port() {
        assert!(refused_url().port().is_some());
    }
}
