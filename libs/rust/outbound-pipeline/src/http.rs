//! HTTP client configuration and the reqwest-backed transport.
//!
//! [`HttpTransport`] is the innermost stage of every pipeline: it performs the
//! network send and classifies reqwest failures into [`PipelineError`]s.

use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, ClientBuilder};
use tower::Service;
use url::Url;

use crate::error::classify_reqwest_error;
use crate::{OutboundRequest, OutboundResponse, PipelineError};

/// HTTP client configuration.
///
/// Defaults suit long-lived typed clients: pooled connections, rustls TLS
/// and a generous transport deadline. Per-client caps belong in the
/// pipeline's timeout layer.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Transport request timeout (default: 100s)
    pub timeout: Duration,
    /// Connection timeout (default: 10s)
    pub connect_timeout: Duration,
    /// Pool idle timeout (default: 90s)
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per host (default: 10)
    pub pool_max_idle_per_host: usize,
    /// User agent string
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(100),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 10,
            user_agent: "shopping-platform-rust/1.0".to_string(),
        }
    }
}

impl HttpConfig {
    /// Create a new HTTP config with custom timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a new HTTP config with custom connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Create a new HTTP config with custom user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Create a new HTTP config with custom pool settings.
    #[must_use]
    pub fn with_pool_config(mut self, idle_timeout: Duration, max_idle: usize) -> Self {
        self.pool_idle_timeout = idle_timeout;
        self.pool_max_idle_per_host = max_idle;
        self
    }
}

/// Build a configured HTTP client.
///
/// # Errors
///
/// Returns an error if the client cannot be built (e.g., TLS initialization fails).
///
/// # Examples
///
/// ```
/// use outbound_pipeline::{HttpConfig, build_http_client};
/// use std::time::Duration;
///
/// let config = HttpConfig::default()
///     .with_timeout(Duration::from_secs(60));
/// let client = build_http_client(&config).expect("Failed to build client");
/// ```
pub fn build_http_client(config: &HttpConfig) -> Result<Client, reqwest::Error> {
    ClientBuilder::new()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(&config.user_agent)
        .use_rustls_tls()
        .build()
}

/// Network stage: sends an [`OutboundRequest`] with reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Wrap an existing reqwest client.
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build the transport from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the reqwest client cannot be built.
    pub fn from_config(config: &HttpConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(build_http_client(config)?))
    }
}

impl Service<OutboundRequest> for HttpTransport {
    type Response = OutboundResponse;
    type Error = PipelineError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: OutboundRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move { send(&client, request).await })
    }
}

async fn send(client: &Client, request: OutboundRequest) -> Result<OutboundResponse, PipelineError> {
    let url = request.url().clone();

    let mut builder = client
        .request(request.method().clone(), url.clone())
        .headers(request.headers().clone());
    if !request.body().is_empty() {
        builder = builder.body(request.body().clone());
    }

    let response = builder.send().await.map_err(|e| transport_error(&url, e))?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| transport_error(&url, e))?;

    Ok(OutboundResponse::new(status, headers, body, request))
}

/// Resolve `path` under `base`, keeping any path prefix the base carries.
///
/// A leading `/` on `path` is treated as relative to the base path.
pub(crate) fn join_under(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
}

pub(crate) fn transport_error(url: &Url, err: reqwest::Error) -> PipelineError {
    PipelineError::transport(classify_reqwest_error(&err), url.clone(), err)
}
