//! Timeout Tower Layer
//!
//! Caps the total time a call may spend in the stages beneath it,
//! retries and backoff included.

use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::timeout;
use tower::{Layer, Service, ServiceExt};

use crate::{OutboundRequest, PipelineError};

/// Timeout layer for Tower
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    duration: Duration,
}

impl TimeoutLayer {
    /// Creates a new timeout layer with the given duration
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Creates a new timeout layer from seconds
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Configured deadline.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            duration: self.duration,
        }
    }
}

/// Timeout service wrapper
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    duration: Duration,
}

impl<S> Service<OutboundRequest> for TimeoutService<S>
where
    S: Service<OutboundRequest, Error = PipelineError> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = PipelineError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: OutboundRequest) -> Self::Future {
        let duration = self.duration;
        let inner = self.inner.clone();

        Box::pin(async move {
            match timeout(duration, inner.oneshot(request)).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout { duration }),
            }
        })
    }
}
