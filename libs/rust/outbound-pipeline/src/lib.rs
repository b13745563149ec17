//! Resilient outbound HTTP pipeline for shopping platform services.
//!
//! This crate provides:
//! - Request/response types and the reqwest-backed transport
//! - A logging handler that answers refused connections with `502 Bad Gateway`
//! - Retry policies with exponential backoff
//! - Circuit breaker pattern for resilience
//! - Per-client timeouts and cancellation
//! - Logging setup with an Elasticsearch sink
//!
//! Stages are Tower layers; [`PipelineBuilder`] assembles them into a
//! [`TypedClient`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod classify;
pub mod elastic_sink;
pub mod error;
pub mod http;
pub mod logging_handler;
pub mod message;
pub mod pipeline;
pub mod retry;
pub mod timeout;
pub mod tracing_config;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitState};
pub use classify::{FailureClassifier, Outcome, transient_http_failure};
pub use elastic_sink::{ElasticsearchSink, ElasticsearchSinkConfig, LogEntry, LogLevel};
pub use error::{PipelineError, TransportErrorKind};
pub use http::{HttpConfig, HttpTransport, build_http_client};
pub use logging_handler::LoggingLayer;
pub use message::{OutboundRequest, OutboundResponse};
pub use pipeline::{BoxPipeline, PipelineBuilder, TypedClient};
pub use retry::{RetryAttempt, RetryConfig, RetryLayer, RetryPolicy};
pub use timeout::TimeoutLayer;
pub use tracing_config::{LoggingConfig, LoggingContext, index_name, init_logging};

pub use tokio_util::sync::CancellationToken;
