//! Pipeline assembly and the typed client.
//!
//! Stages, outermost first:
//!
//! ```text
//! Timeout → Logging → Retry → CircuitBreaker → transport
//! ```
//!
//! Every stage is optional except logging and the transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};
use url::Url;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitState};
use crate::http::join_under;
use crate::logging_handler::LoggingLayer;
use crate::retry::{RetryLayer, RetryPolicy};
use crate::timeout::TimeoutLayer;
use crate::tracing_config::LoggingContext;
use crate::{OutboundRequest, OutboundResponse, PipelineError};

/// Type-erased pipeline stage.
pub type BoxPipeline = BoxCloneSyncService<OutboundRequest, OutboundResponse, PipelineError>;

/// Builder for a [`TypedClient`].
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: Arc<str>,
    base_url: Url,
    logging: LoggingContext,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    circuit_breaker: Option<CircuitBreakerConfig>,
}

impl PipelineBuilder {
    /// Start a pipeline for the named client.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, base_url: Url, logging: &LoggingContext) -> Self {
        Self {
            name: name.into(),
            base_url,
            logging: logging.clone(),
            timeout: None,
            retry: None,
            circuit_breaker: None,
        }
    }

    /// Cap the total time of a call, retries included.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry transient failures.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Break the circuit after repeated failures.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Assemble the stages around `transport`.
    pub fn build<T>(self, transport: T) -> TypedClient
    where
        T: Service<OutboundRequest, Response = OutboundResponse, Error = PipelineError>
            + Clone
            + Send
            + Sync
            + 'static,
        T::Future: Send + 'static,
    {
        let mut service = BoxPipeline::new(transport);

        let circuit_breaker = self
            .circuit_breaker
            .map(|config| Arc::new(CircuitBreaker::new(self.name.as_ref(), config)));
        if let Some(breaker) = &circuit_breaker {
            service = BoxPipeline::new(CircuitBreakerLayer::shared(Arc::clone(breaker)).layer(service));
        }
        if let Some(policy) = self.retry {
            service = BoxPipeline::new(RetryLayer::new(policy).layer(service));
        }
        service = BoxPipeline::new(LoggingLayer::new(&self.logging, Arc::clone(&self.name)).layer(service));
        if let Some(timeout) = self.timeout {
            service = BoxPipeline::new(TimeoutLayer::new(timeout).layer(service));
        }

        TypedClient {
            name: self.name,
            base_url: self.base_url,
            service,
            circuit_breaker,
        }
    }
}

/// A named client bound to one downstream service.
///
/// Clones share the pipeline, including circuit breaker state.
#[derive(Clone)]
pub struct TypedClient {
    name: Arc<str>,
    base_url: Url,
    service: BoxPipeline,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl fmt::Debug for TypedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url.as_str())
            .field("circuit_state", &self.circuit_state())
            .finish_non_exhaustive()
    }
}

impl TypedClient {
    /// Client name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base address of the downstream service.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a path under the base address, keeping the base's own path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be joined onto the base URL.
    pub fn url(&self, path: &str) -> Result<Url, PipelineError> {
        join_under(&self.base_url, path)
            .map_err(|e| PipelineError::invalid_request(format!("invalid path {path:?} for {}: {e}", self.name)))
    }

    /// Build a request for a path under the base address.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be joined onto the base URL.
    pub fn request(&self, method: Method, path: &str) -> Result<OutboundRequest, PipelineError> {
        Ok(OutboundRequest::new(method, self.url(path)?))
    }

    /// Build a GET request for a path under the base address.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be joined onto the base URL.
    pub fn get(&self, path: &str) -> Result<OutboundRequest, PipelineError> {
        self.request(Method::GET, path)
    }

    /// Current circuit state, if the client has a breaker.
    #[must_use]
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.circuit_breaker.as_ref().map(|breaker| breaker.state())
    }

    /// The client's breaker, if any.
    #[must_use]
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    /// Send a request through the pipeline.
    ///
    /// Cancelling `cancel` abandons the call at whatever point it has
    /// reached, including a backoff sleep.
    ///
    /// # Errors
    ///
    /// Returns the error the pipeline produced, or
    /// [`PipelineError::Cancelled`].
    pub async fn send(
        &self,
        request: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<OutboundResponse, PipelineError> {
        let call = self.service.clone().oneshot(request);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PipelineError::Cancelled),
            outcome = call => outcome,
        }
    }
}
