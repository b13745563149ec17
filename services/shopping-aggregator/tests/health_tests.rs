//! Integration tests for the aggregator's health endpoint.

use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use outbound_pipeline::{CircuitState, LoggingContext};
use serde_json::Value;
use shopping_aggregator::{
    AppState, Config, HealthCheck, HealthCheckResult, HealthCheckService, HealthStatus, ServiceClients, UrlHealthCheck, router,
};
use test_utils::{LogCapture, MockOutcome, MockTransport, fixtures};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(vars: &[(&str, String)]) -> Config {
    Config::from_source(|name| {
        vars.iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.clone())
            .or_else(|| match name {
                "RETRY_COUNT" => Some("0".to_string()),
                _ => None,
            })
    })
    .unwrap()
}

fn urls(catalog: &str, basket: &str, ordering: &str) -> Vec<(&'static str, String)> {
    vec![
        ("CATALOG_URL", catalog.to_string()),
        ("BASKET_URL", basket.to_string()),
        ("ORDERING_URL", ordering.to_string()),
    ]
}

async fn swagger_server(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/swagger/index.html"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn health(config: &Config, logging: &LoggingContext) -> (ServiceClients, HealthCheckService) {
    let clients = ServiceClients::new(config, logging).unwrap();
    let health = HealthCheckService::for_clients(&clients, config.health_timeout());
    (clients, health)
}

async fn get_hc(health: HealthCheckService) -> (StatusCode, Value) {
    let response = router(AppState::new(health))
        .oneshot(Request::builder().uri("/hc").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

struct AlwaysUnhealthy;

#[async_trait::async_trait]
impl HealthCheck for AlwaysUnhealthy {
    fn name(&self) -> &str {
        "Storage"
    }

    async fn check(&self) -> HealthCheckResult {
        HealthCheckResult::failed(HealthStatus::Unhealthy, "disk full")
    }
}

/// Test every downstream answering yields a healthy report.
#[tokio::test]
async fn test_all_downstreams_healthy() {
    let server = swagger_server(200).await;
    let uri = server.uri();
    let config = config(&urls(&uri, &uri, &uri));
    let (_, health) = health(&config, &fixtures::logging_context());

    let (status, body) = get_hc(health).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Healthy");
    for name in ["Catalog API", "Basket API", "Ordering API"] {
        let entry = &body["entries"][name];
        assert_eq!(entry["status"], "Healthy", "{name}");
        assert_eq!(entry["data"]["url"], format!("{uri}/swagger/index.html"));
        assert_eq!(entry["data"]["circuitState"], "closed");
        assert!(entry.get("description").is_none());
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

/// Test a failing downstream degrades the report without failing the endpoint.
#[tokio::test]
async fn test_server_error_degrades() {
    let healthy = swagger_server(200).await;
    let failing = swagger_server(500).await;
    let config = config(&urls(&failing.uri(), &healthy.uri(), &healthy.uri()));
    let (_, health) = health(&config, &fixtures::logging_context());

    let (status, body) = get_hc(health).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Degraded");
    assert_eq!(body["entries"]["Catalog API"]["status"], "Degraded");
    assert!(body["entries"]["Catalog API"]["description"].as_str().unwrap().contains("500"));
    assert_eq!(body["entries"]["Basket API"]["status"], "Healthy");
}

/// Test an unreachable downstream is answered with 502 and reported degraded.
#[tokio::test]
async fn test_refused_downstream_degrades() {
    let (capture, _guard) = LogCapture::install();
    let healthy = swagger_server(200).await;
    let refused = fixtures::refused_url();
    let config = config(&urls(&healthy.uri(), &healthy.uri(), refused.as_str()));
    let (_, health) = health(&config, &fixtures::logging_context());

    let report = health.run().await;

    assert_eq!(report.status, HealthStatus::Degraded);
    let ordering = &report.entries["Ordering API"];
    assert_eq!(ordering.status, HealthStatus::Degraded);
    assert!(ordering.description.as_deref().unwrap().contains("502"));

    let critical = capture.critical();
    assert_eq!(critical.len(), 1);
    assert_eq!(
        critical[0].field("host"),
        Some(format!("127.0.0.1:{}", refused.port().unwrap()).as_str())
    );
}

/// Test failing probes open the client's circuit and later probes fail fast.
#[tokio::test]
async fn test_probes_share_client_circuit() {
    let failing = swagger_server(503).await;
    let healthy = swagger_server(200).await;
    let mut vars = urls(&healthy.uri(), &failing.uri(), &healthy.uri());
    vars.push(("CB_FAILURE_THRESHOLD", "1".to_string()));
    let config = config(&vars);
    let (clients, health) = health(&config, &fixtures::logging_context());

    health.run().await;
    assert_eq!(clients.basket.circuit_state(), Some(CircuitState::Open));

    let report = health.run().await;
    let basket = &report.entries["Basket API"];
    assert_eq!(basket.status, HealthStatus::Degraded);
    assert!(basket.description.as_deref().unwrap().contains("Circuit breaker open"));
    assert_eq!(basket.data["circuitState"], "open");
    assert_eq!(failing.received_requests().await.unwrap().len(), 1);
}

/// Test an unhealthy check turns the endpoint into 503.
#[tokio::test]
async fn test_unhealthy_check_returns_service_unavailable() {
    let server = swagger_server(200).await;
    let uri = server.uri();
    let config = config(&urls(&uri, &uri, &uri));
    let (_, health) = health(&config, &fixtures::logging_context());

    let (status, body) = get_hc(health.with_check(AlwaysUnhealthy)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "Unhealthy");
    assert_eq!(body["entries"]["Storage"]["description"], "disk full");
}

/// Test a hung basket call is cut off by the basket timeout before the probe deadline.
#[tokio::test(start_paused = true)]
async fn test_basket_timeout_bounds_probe() {
    let config = config(&[("HEALTH_TIMEOUT", "10".to_string())]);
    let transport = MockTransport::new();
    let clients = ServiceClients::with_transport(&config, &fixtures::logging_context(), transport.clone());

    let hung = MockTransport::with_fallback(MockOutcome::Hang);
    let basket_only = ServiceClients::with_transport(&config, &fixtures::logging_context(), hung);
    let health = HealthCheckService::new()
        .with_check(UrlHealthCheck::new(
            "Catalog API",
            clients.catalog.clone(),
            config.health_timeout(),
        ))
        .with_check(UrlHealthCheck::new(
            "Basket API",
            basket_only.basket.clone(),
            config.health_timeout(),
        ));

    let started = tokio::time::Instant::now();
    let report = health.run().await;

    assert_eq!(started.elapsed(), Duration::from_secs(4));
    assert_eq!(report.entries["Catalog API"].status, HealthStatus::Healthy);
    let basket = &report.entries["Basket API"];
    assert_eq!(basket.status, HealthStatus::Degraded);
    assert!(basket.description.as_deref().unwrap().contains("timed out after 4s"));
    assert_eq!(transport.calls(), 1);
}

/// Test a downstream behind a path prefix is probed under that prefix.
#[tokio::test]
async fn test_probe_keeps_base_path() {
    let gateway = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/catalog/swagger/index.html"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&gateway)
        .await;
    let healthy = swagger_server(200).await;
    let catalog = format!("{}/catalog", gateway.uri());
    let config = config(&urls(&catalog, &healthy.uri(), &healthy.uri()));
    let (_, health) = health(&config, &fixtures::logging_context());

    let report = health.run().await;

    let entry = &report.entries["Catalog API"];
    assert_eq!(entry.status, HealthStatus::Healthy);
    assert_eq!(entry.data["url"], format!("{catalog}/swagger/index.html"));
}
