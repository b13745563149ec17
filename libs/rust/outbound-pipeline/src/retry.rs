//! Retry policy with exponential backoff.
//!
//! The policy retries outcomes its classifier marks as handled failures
//! (by default transient HTTP failures), sleeping `initial_delay ·
//! multiplier^n` before retry `n`. Once retries are exhausted the last
//! outcome is handed back unchanged, whether that is a 5xx response or an
//! error.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tower::{Layer, Service, ServiceExt};
use tracing::error;

use crate::classify::{FailureClassifier, Outcome, describe, transient_http_failure};
use crate::{OutboundRequest, OutboundResponse, PipelineError};

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay; retry `n` waits `initial_delay * multiplier^n`
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
    /// Which outcomes are retried
    pub classifier: FailureClassifier,
    /// Name reported to the retry callback
    pub policy_key: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
            classifier: transient_http_failure,
            policy_key: "retry".to_string(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom max retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Create a new retry config with custom initial delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Create a new retry config with custom max delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Create a new retry config with a custom backoff multiplier.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Create a new retry config with up to 25% jitter on every delay.
    #[must_use]
    pub const fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Create a new retry config with a custom failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Create a new retry config with a custom policy key.
    #[must_use]
    pub fn with_policy_key(mut self, key: impl Into<String>) -> Self {
        self.policy_key = key.into();
        self
    }
}

/// Details handed to the retry callback before each backoff.
#[derive(Debug, Clone)]
pub struct RetryAttempt<'a> {
    /// Retry number, starting at 1
    pub attempt: u32,
    /// Delay before the retry is sent
    pub delay: Duration,
    /// Policy that is retrying
    pub policy_key: &'a str,
    /// Operation being retried, if the request named one
    pub operation_key: Option<&'a str>,
    /// What went wrong on the previous attempt
    pub cause: String,
}

/// Callback invoked before each retry.
pub type RetryCallback = Arc<dyn Fn(&RetryAttempt<'_>) + Send + Sync>;

/// Default retry callback: one error-level event per retry.
pub fn log_retry(attempt: &RetryAttempt<'_>) {
    let operation = attempt.operation_key.unwrap_or("-");
    error!(
        attempt = attempt.attempt,
        policy_key = attempt.policy_key,
        operation_key = operation,
        delay_ms = u64::try_from(attempt.delay.as_millis()).unwrap_or(u64::MAX),
        "Retry {} of {} at {}, due to: {}.",
        attempt.attempt,
        attempt.policy_key,
        operation,
        attempt.cause
    );
}

/// Retry policy for executing calls with automatic retries.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    on_retry: RetryCallback,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            on_retry: Arc::new(log_retry),
        }
    }

    /// Create a retry policy with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Replace the retry callback.
    #[must_use]
    pub fn with_on_retry<F>(mut self, on_retry: F) -> Self
    where
        F: Fn(&RetryAttempt<'_>) + Send + Sync + 'static,
    {
        self.on_retry = Arc::new(on_retry);
        self
    }

    /// Calculate the delay before the given retry (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.config.initial_delay.as_millis() as f64 * self.config.multiplier.powi(exponent);

        let delay_ms = base_delay.min(self.config.max_delay.as_millis() as f64);

        let final_delay = if self.config.jitter {
            // Add up to 25% jitter
            let jitter_factor = 1.0 + (rand::random::<f64>() * 0.25);
            delay_ms * jitter_factor
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Check if an outcome should be retried after `retries` retries.
    #[must_use]
    pub fn should_retry(&self, outcome: &Outcome, retries: u32) -> bool {
        retries < self.config.max_retries && (self.config.classifier)(outcome)
    }

    /// Execute a call with retries.
    ///
    /// `operation` is invoked once per attempt. The returned outcome is the
    /// first one that is not retried.
    pub async fn execute<F, Fut>(&self, operation_key: Option<&str>, mut operation: F) -> Outcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let mut retries = 0;
        loop {
            let outcome = operation().await;
            if !self.should_retry(&outcome, retries) {
                return outcome;
            }

            retries += 1;
            let delay = self.delay_for_attempt(retries);
            (self.on_retry)(&RetryAttempt {
                attempt: retries,
                delay,
                policy_key: &self.config.policy_key,
                operation_key,
                cause: describe(&outcome),
            });
            tokio::time::sleep(delay).await;
        }
    }

    /// Get the maximum number of retries.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Tower layer applying a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    /// Creates a new retry layer
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Retry service wrapper
#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Service<OutboundRequest> for RetryService<S>
where
    S: Service<OutboundRequest, Response = OutboundResponse, Error = PipelineError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = OutboundResponse;
    type Error = PipelineError;
    type Future = BoxFuture<'static, Outcome>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: OutboundRequest) -> Self::Future {
        let policy = self.policy.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            let operation_key = request.operation_key().map(str::to_owned);
            policy
                .execute(operation_key.as_deref(), move || inner.clone().oneshot(request.clone()))
                .await
        })
    }
}
