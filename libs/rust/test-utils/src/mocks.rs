//! Mock implementations for testing.
//!
//! [`MockTransport`] stands in for the HTTP transport with a scripted
//! sequence of outcomes. [`LogCapture`] records `tracing` events so tests
//! can assert on what a stage logged.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use outbound_pipeline::{OutboundRequest, OutboundResponse, PipelineError, TransportErrorKind};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::time::Instant;
use tower::Service;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

/// What the mock transport does with one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    /// Answer with this status and an empty body
    Status(StatusCode),
    /// Fail as if the port refused the connection
    ConnectionRefused,
    /// Fail with a transport error of the given kind
    TransportFailure(TransportErrorKind),
    /// Fail with a non-transient error
    InvalidRequest,
    /// Never complete
    Hang,
}

impl MockOutcome {
    /// Shorthand for [`MockOutcome::Status`].
    #[must_use]
    pub fn status(code: u16) -> Self {
        Self::Status(StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
    }
}

#[derive(Debug)]
struct MockState {
    script: VecDeque<MockOutcome>,
    fallback: MockOutcome,
    requests: Vec<(Instant, OutboundRequest)>,
}

/// Scripted transport. Clones share the script and the call record.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("remaining", &state.script.len())
            .field("calls", &state.requests.len())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport that answers `200 OK` once the script runs out.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fallback(MockOutcome::Status(StatusCode::OK))
    }

    /// A transport that answers with `fallback` once the script runs out.
    #[must_use]
    pub fn with_fallback(fallback: MockOutcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                fallback,
                requests: Vec::new(),
            })),
        }
    }

    /// A transport that plays `outcomes` in order, then answers `200 OK`.
    #[must_use]
    pub fn scripted(outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        let transport = Self::new();
        transport.state.lock().script.extend(outcomes);
        transport
    }

    /// Append an outcome to the script.
    pub fn push(&self, outcome: MockOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    /// Number of calls that reached the transport.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Requests received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.state.lock().requests.iter().map(|(_, r)| r.clone()).collect()
    }

    /// When each call arrived, on the tokio clock.
    #[must_use]
    pub fn call_times(&self) -> Vec<Instant> {
        self.state.lock().requests.iter().map(|(t, _)| *t).collect()
    }

    fn next(&self, request: &OutboundRequest) -> MockOutcome {
        let mut state = self.state.lock();
        state.requests.push((Instant::now(), request.clone()));
        let fallback = state.fallback;
        state.script.pop_front().unwrap_or(fallback)
    }
}

impl Service<OutboundRequest> for MockTransport {
    type Response = OutboundResponse;
    type Error = PipelineError;
    type Future = BoxFuture<'static, Result<OutboundResponse, PipelineError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: OutboundRequest) -> Self::Future {
        let outcome = self.next(&request);
        Box::pin(async move {
            let url = request.url().clone();
            match outcome {
                MockOutcome::Status(status) => Ok(OutboundResponse::synthesized(status, request)),
                MockOutcome::ConnectionRefused => Err(PipelineError::connection_refused(
                    url,
                    io::Error::from(io::ErrorKind::ConnectionRefused),
                )),
                MockOutcome::TransportFailure(kind) => {
                    Err(PipelineError::transport(kind, url, io::Error::other("mock transport failure")))
                }
                MockOutcome::InvalidRequest => Err(PipelineError::invalid_request("mock rejected request")),
                MockOutcome::Hang => futures::future::pending().await,
            }
        })
    }
}

/// One recorded `tracing` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    /// Event level
    pub level: Level,
    /// Event target
    pub target: String,
    /// Rendered message
    pub message: String,
    /// Other fields, rendered as strings
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    /// Value of a field, if present.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Whether the event carries `severity = "critical"`.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.field("severity") == Some("critical")
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.insert(field.name().to_string(), rendered);
        }
    }
}

/// Layer recording every event it sees.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    /// Install a capturing subscriber for the current thread.
    ///
    /// Events are recorded until the returned guard is dropped.
    #[must_use]
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let guard = tracing::subscriber::set_default(Registry::default().with(capture.clone()));
        (capture, guard)
    }

    /// All recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// Events whose target starts with `prefix`.
    #[must_use]
    pub fn events_from(&self, prefix: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.target.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Events at exactly `level` whose target starts with `prefix`.
    #[must_use]
    pub fn events_at(&self, level: Level, prefix: &str) -> Vec<CapturedEvent> {
        self.events_from(prefix).into_iter().filter(|e| e.level == level).collect()
    }

    /// Critical events.
    #[must_use]
    pub fn critical(&self) -> Vec<CapturedEvent> {
        self.events.lock().iter().filter(|e| e.is_critical()).cloned().collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}
