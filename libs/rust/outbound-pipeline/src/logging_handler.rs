//! Logging-and-fallback Tower layer.
//!
//! Logs the result of every call that passes through it. A refused
//! connection is logged as critical and answered with a synthesized
//! `502 Bad Gateway` so callers see a failed status rather than an error.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use reqwest::StatusCode;
use tower::{Layer, Service, ServiceExt};
use tracing::{Instrument, error, info, info_span, warn};

use crate::tracing_config::LoggingContext;
use crate::{OutboundRequest, OutboundResponse, PipelineError};

/// Logging layer for Tower
#[derive(Debug, Clone)]
pub struct LoggingLayer {
    client: Arc<str>,
    context: LoggingContext,
}

impl LoggingLayer {
    /// Creates a new logging layer for the named client
    #[must_use]
    pub fn new(context: &LoggingContext, client: impl Into<Arc<str>>) -> Self {
        Self {
            client: client.into(),
            context: context.clone(),
        }
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            client: Arc::clone(&self.client),
            context: self.context.clone(),
        }
    }
}

/// Logging service wrapper
#[derive(Debug, Clone)]
pub struct LoggingService<S> {
    inner: S,
    client: Arc<str>,
    context: LoggingContext,
}

impl<S> Service<OutboundRequest> for LoggingService<S>
where
    S: Service<OutboundRequest, Response = OutboundResponse, Error = PipelineError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = OutboundResponse;
    type Error = PipelineError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: OutboundRequest) -> Self::Future {
        let inner = self.inner.clone();

        let span = info_span!(
            "outbound_request",
            client = %self.client,
            application = %self.context.application(),
            environment = %self.context.environment(),
            method = %request.method(),
        );

        Box::pin(
            async move {
                let original = request.clone();
                match inner.oneshot(request).await {
                    Ok(response) => {
                        let url = response.request().url();
                        if response.is_success() {
                            info!(url = %url, "Received a success response from {}", url);
                        } else {
                            warn!(
                                status_code = response.status().as_u16(),
                                url = %url,
                                "Received a non-success status code {} from {}",
                                response.status().as_u16(),
                                url
                            );
                        }
                        Ok(response)
                    }
                    Err(err) if err.is_connection_refused() => {
                        let host = original.authority();
                        error!(
                            severity = "critical",
                            host = %host,
                            error = %err,
                            "Unable to connect to {}. Please check the configuration to ensure the correct URL for the service has been configured",
                            host
                        );
                        Ok(OutboundResponse::synthesized(StatusCode::BAD_GATEWAY, original))
                    }
                    Err(err) => Err(err),
                }
            }
            .instrument(span),
        )
    }
}
