//! Circuit breaker for typed clients.
//!
//! # States
//! - Closed: calls pass through, consecutive transient failures are counted
//! - Open: calls are rejected without reaching the transport
//! - Half-Open: one trial call is admitted to probe recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: first call after break_duration elapsed
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails (break timer restarts)
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::classify::{FailureClassifier, Outcome, transient_http_failure};
use crate::{OutboundRequest, OutboundResponse, PipelineError};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests are allowed
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, a single trial request is allowed
    HalfOpen,
}

impl CircuitState {
    /// Convert to string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive handled failures before opening the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial call
    pub break_duration: Duration,
    /// Which outcomes count as failures
    pub classifier: FailureClassifier,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
            classifier: transient_http_failure,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with custom failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Create a new config with custom break duration.
    #[must_use]
    pub const fn with_break_duration(mut self, duration: Duration) -> Self {
        self.break_duration = duration;
        self
    }

    /// Create a new config with a custom failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    break_until: Option<Instant>,
    trial_started: Option<Instant>,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            break_until: None,
            trial_started: None,
        }
    }

    fn open(&mut self, now: Instant, break_duration: Duration) {
        self.state = CircuitState::Open;
        self.break_until = Some(now + break_duration);
        self.trial_started = None;
    }
}

/// Circuit breaker shared by every clone of one typed client.
///
/// All transitions happen under a single lock that is never held across an
/// await point.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    /// Create a circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Name used in logs and rejection errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Admit or reject a call.
    ///
    /// The first call after the break elapses moves the circuit to half-open
    /// and becomes the trial. While a trial is in flight other calls are
    /// rejected; a trial that never reports back stops blocking after one
    /// more break duration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CircuitOpen`] when the call must not be sent.
    pub fn try_acquire(&self) -> Result<(), PipelineError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let until = state.break_until.unwrap_or(now);
                if now >= until {
                    state.state = CircuitState::HalfOpen;
                    state.trial_started = Some(now);
                    info!(circuit = %self.name, "Circuit half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(self.rejection(until.saturating_duration_since(now)))
                }
            }
            CircuitState::HalfOpen => {
                let trial_expires = state
                    .trial_started
                    .map_or(now, |started| started + self.config.break_duration);
                if now >= trial_expires {
                    state.trial_started = Some(now);
                    Ok(())
                } else {
                    Err(self.rejection(trial_expires.saturating_duration_since(now)))
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                *state = BreakerState::new();
                info!(circuit = %self.name, "Circuit closed after successful trial call");
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.open(now, self.config.break_duration);
                    warn!(
                        circuit = %self.name,
                        failures = state.consecutive_failures,
                        break_secs = self.config.break_duration.as_secs(),
                        "Circuit opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.open(now, self.config.break_duration);
                warn!(circuit = %self.name, "Circuit re-opened after failed trial call");
            }
            CircuitState::Open => {}
        }
    }

    /// Record an outcome using the configured classifier.
    ///
    /// Handled failures count against the circuit, successful responses reset
    /// it, and unclassified errors are ignored.
    pub fn record(&self, outcome: &Outcome) {
        if (self.config.classifier)(outcome) {
            self.record_failure();
        } else if outcome.is_ok() {
            self.record_success();
        }
    }

    /// Get the current circuit state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get the current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::new();
    }

    fn rejection(&self, retry_after: Duration) -> PipelineError {
        PipelineError::circuit_open(&self.name, retry_after)
    }
}

/// Tower layer placing a shared [`CircuitBreaker`] in front of a stage.
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    /// Create a layer with its own breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::shared(Arc::new(CircuitBreaker::new(name, config)))
    }

    /// Create a layer around an existing breaker.
    #[must_use]
    pub const fn shared(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    /// The breaker this layer reports to.
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: Arc::clone(&self.breaker),
        }
    }
}

/// Circuit breaker service wrapper.
#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> Service<OutboundRequest> for CircuitBreakerService<S>
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
        let breaker = Arc::clone(&self.breaker);
        let inner = self.inner.clone();

        Box::pin(async move {
            if let Err(rejection) = breaker.try_acquire() {
                debug!(circuit = %breaker.name(), url = %request.url(), "Call rejected by open circuit");
                return Err(rejection);
            }

            let outcome = inner.oneshot(request).await;
            breaker.record(&outcome);
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use url::Url;

    fn response(status: StatusCode) -> Outcome {
        let req = OutboundRequest::get(Url::parse("http://localhost:8000/").unwrap());
        Ok(OutboundResponse::synthesized(status, req))
    }

    fn config(threshold: u32, break_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_break_duration(Duration::from_secs(break_secs))
    }

    #[test]
    fn test_initial_state_closed() {
        let cb = CircuitBreaker::with_defaults("catalog");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.break_duration, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_failures() {
        let cb = CircuitBreaker::new("basket", config(3, 30));

        for _ in 0..3 {
            cb.record_failure();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        let err = cb.try_acquire().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CircuitOpen { ref client, retry_after } if client == "basket" && retry_after == Duration::from_secs(30)
        ));
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = CircuitBreaker::new("catalog", config(3, 30));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();

        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = CircuitBreaker::new("ordering", config(2, 30));
        cb.record_failure();
        cb.record_failure();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Trial in flight: everybody else is turned away.
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes() {
        let cb = CircuitBreaker::new("ordering", config(1, 30));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;
        cb.try_acquire().unwrap();

        cb.record_success();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens_and_restarts_timer() {
        let cb = CircuitBreaker::new("ordering", config(1, 30));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;
        cb.try_acquire().unwrap();

        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_is_replaced_after_break() {
        let cb = CircuitBreaker::new("catalog", config(1, 30));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;
        cb.try_acquire().unwrap();

        // Trial never reports back.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_record_uses_classifier() {
        let cb = CircuitBreaker::new("catalog", config(2, 30));

        cb.record(&response(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(cb.failure_count(), 1);

        // 4xx is not a handled failure and counts as a success.
        cb.record(&response(StatusCode::NOT_FOUND));
        assert_eq!(cb.failure_count(), 0);

        // Unclassified errors leave the count untouched.
        cb.record(&response(StatusCode::BAD_GATEWAY));
        cb.record(&Err(PipelineError::Cancelled));
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::new("catalog", config(2, 30));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }
}
