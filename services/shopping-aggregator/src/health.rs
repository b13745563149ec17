//! Health checks for the downstream APIs.
//!
//! Each downstream is probed through its typed client, so a probe shares the
//! client's retry policy and circuit breaker. The aggregate report uses the
//! same JSON shape health dashboards expect.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use futures::future::join_all;
use outbound_pipeline::{CancellationToken, PipelineError, TypedClient};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clients::ServiceClients;

/// Path probed on every downstream.
pub const PROBE_PATH: &str = "/swagger/index.html";

/// Health of a single check or of the whole service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HealthStatus {
    /// Working normally
    Healthy,
    /// Working with reduced functionality
    Degraded,
    /// Not working
    Unhealthy,
}

impl HealthStatus {
    /// Worst status of a set; an empty set is healthy.
    pub fn worst(statuses: impl IntoIterator<Item = Self>) -> Self {
        statuses.into_iter().max().unwrap_or(Self::Healthy)
    }

    /// HTTP status the health endpoint answers with.
    #[must_use]
    pub const fn http_status(self) -> StatusCode {
        match self {
            Self::Healthy | Self::Degraded => StatusCode::OK,
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckResult {
    /// Status reported by the check
    pub status: HealthStatus,
    /// Human-readable detail, usually set on failure
    pub description: Option<String>,
    /// Extra key/value data
    pub data: BTreeMap<String, Value>,
}

impl HealthCheckResult {
    /// A healthy result.
    #[must_use]
    pub const fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            description: None,
            data: BTreeMap::new(),
        }
    }

    /// A failed result with the given status.
    #[must_use]
    pub fn failed(status: HealthStatus, description: impl Into<String>) -> Self {
        Self {
            status,
            description: Some(description.into()),
            data: BTreeMap::new(),
        }
    }

    /// Attach a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A named health check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name shown in the report.
    fn name(&self) -> &str;

    /// Tags shown in the report.
    fn tags(&self) -> &[String] {
        &[]
    }

    /// Run the check.
    async fn check(&self) -> HealthCheckResult;
}

/// Probes a downstream page through its typed client.
#[derive(Debug, Clone)]
pub struct UrlHealthCheck {
    name: String,
    client: TypedClient,
    failure_status: HealthStatus,
    timeout: Duration,
    tags: Vec<String>,
}

impl UrlHealthCheck {
    /// Check `client`'s probe page, reporting `Degraded` on failure.
    pub fn new(name: impl Into<String>, client: TypedClient, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            client,
            failure_status: HealthStatus::Degraded,
            timeout,
            tags: Vec::new(),
        }
    }

    /// Status reported when the probe fails.
    #[must_use]
    pub const fn with_failure_status(mut self, status: HealthStatus) -> Self {
        self.failure_status = status;
        self
    }

    /// Tags shown in the report.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    async fn probe(&self) -> Result<StatusCode, PipelineError> {
        let request = self.client.get(PROBE_PATH)?.with_operation_key("HealthCheck");
        let cancel = CancellationToken::new();

        match tokio::time::timeout(self.timeout, self.client.send(request, &cancel)).await {
            Ok(outcome) => outcome.map(|resp| resp.status()),
            Err(_) => Err(PipelineError::Timeout {
                duration: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl HealthCheck for UrlHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    async fn check(&self) -> HealthCheckResult {
        let url = self
            .client
            .url(PROBE_PATH)
            .map_or_else(|_| self.client.base_url().to_string(), |u| u.to_string());

        let result = match self.probe().await {
            Ok(status) if status.is_success() => HealthCheckResult::healthy(),
            Ok(status) => HealthCheckResult::failed(
                self.failure_status,
                format!("{url} answered with status code {}", status.as_u16()),
            ),
            Err(e) => {
                warn!(check = %self.name, error = %e, "Health probe failed");
                HealthCheckResult::failed(self.failure_status, e.to_string())
            }
        };

        let result = result.with_data("url", url);
        match self.client.circuit_state() {
            Some(state) => result.with_data("circuitState", state.as_str()),
            None => result,
        }
    }
}

/// Runs every registered check.
#[derive(Default, Clone)]
pub struct HealthCheckService {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl std::fmt::Debug for HealthCheckService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.checks.iter().map(|c| c.name()).collect();
        f.debug_struct("HealthCheckService").field("checks", &names).finish()
    }
}

impl HealthCheckService {
    /// An empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One degraded-on-failure URL check per downstream.
    #[must_use]
    pub fn for_clients(clients: &ServiceClients, timeout: Duration) -> Self {
        clients
            .named()
            .into_iter()
            .fold(Self::new(), |service, (name, client)| {
                service.with_check(UrlHealthCheck::new(name, client.clone(), timeout))
            })
    }

    /// Register a check.
    #[must_use]
    pub fn with_check(mut self, check: impl HealthCheck + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    /// Number of registered checks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether no check is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run all checks concurrently.
    pub async fn run(&self) -> HealthReport {
        let started = Instant::now();

        let entries = join_all(self.checks.iter().map(|check| async move {
            let check_started = Instant::now();
            let result = check.check().await;
            let entry = HealthReportEntry {
                data: result.data,
                description: result.description,
                duration: format_duration(check_started.elapsed()),
                status: result.status,
                tags: check.tags().to_vec(),
            };
            (check.name().to_string(), entry)
        }))
        .await;

        let entries: BTreeMap<String, HealthReportEntry> = entries.into_iter().collect();
        let status = HealthStatus::worst(entries.values().map(|e| e.status));
        debug!(status = ?status, checks = entries.len(), "Health checks completed");

        HealthReport {
            status,
            total_duration: format_duration(started.elapsed()),
            entries,
        }
    }
}

/// Aggregate health report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Worst status of all entries
    pub status: HealthStatus,
    /// Wall time of the whole run
    pub total_duration: String,
    /// Results by check name
    pub entries: BTreeMap<String, HealthReportEntry>,
}

/// One check in a [`HealthReport`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReportEntry {
    /// Extra key/value data
    pub data: BTreeMap<String, Value>,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Wall time of the check
    pub duration: String,
    /// Check status
    pub status: HealthStatus,
    /// Check tags
    pub tags: Vec<String>,
}

/// Format as `HH:MM:SS.fffffff` (100 ns resolution).
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let ticks = duration.subsec_nanos() / 100;
    format!(
        "{:02}:{:02}:{:02}.{ticks:07}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}
