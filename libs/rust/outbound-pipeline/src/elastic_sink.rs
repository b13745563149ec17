//! Elasticsearch log sink.
//!
//! [`ElasticsearchLayer`] turns `tracing` events into [`LogEntry`] documents
//! and buffers them in memory. [`ElasticsearchSink::flush`] ships the buffer
//! through the bulk API in batches, behind its own circuit breaker, and
//! re-queues a batch that could not be delivered.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber, debug, warn};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use url::Url;

use crate::http::{HttpConfig, build_http_client, join_under, transport_error};
use crate::{CircuitBreaker, CircuitBreakerConfig, PipelineError};

/// Event targets never shipped: the sink's own diagnostics and its HTTP stack.
const IGNORED_TARGETS: &[&str] = &["outbound_pipeline::elastic_sink", "reqwest", "hyper", "h2", "rustls"];

/// Breaker transitions of the sink's own circuit are not shipped either.
const BREAKER_TARGET: &str = "outbound_pipeline::circuit_breaker";

/// Severity names used in shipped documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    /// `TRACE`
    Verbose,
    /// `DEBUG`
    Debug,
    /// `INFO`
    Information,
    /// `WARN`
    Warning,
    /// `ERROR`
    Error,
    /// `ERROR` carrying `severity = "critical"`
    Fatal,
}

impl LogLevel {
    /// Map a tracing level; `critical` promotes errors to [`LogLevel::Fatal`].
    #[must_use]
    pub fn from_tracing(level: Level, critical: bool) -> Self {
        match level {
            Level::TRACE => Self::Verbose,
            Level::DEBUG => Self::Debug,
            Level::INFO => Self::Information,
            Level::WARN => Self::Warning,
            _ if critical => Self::Fatal,
            _ => Self::Error,
        }
    }

    /// Convert to string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Verbose => "Verbose",
            Self::Debug => "Debug",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One document in the log index.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Event time
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Rendered message
    pub message: String,
    /// Module path that emitted the event
    pub target: String,
    /// Structured fields, enrichment included
    pub fields: BTreeMap<String, Value>,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            target: target.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a structured field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Properties stamped on every shipped document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    /// Application name
    pub application: String,
    /// Environment name
    pub environment: String,
    /// Host name
    pub machine_name: String,
}

impl Enrichment {
    fn apply(&self, fields: &mut BTreeMap<String, Value>) {
        fields.insert("Application".to_string(), Value::from(self.application.as_str()));
        fields.insert("Environment".to_string(), Value::from(self.environment.as_str()));
        fields.insert("MachineName".to_string(), Value::from(self.machine_name.as_str()));
    }
}

/// Elasticsearch sink configuration.
#[derive(Debug, Clone)]
pub struct ElasticsearchSinkConfig {
    /// Cluster base URI
    pub uri: Url,
    /// Index documents are written to
    pub index_name: String,
    /// Name of the index template
    pub template_name: String,
    /// Pattern the template applies to
    pub index_pattern: String,
    /// Register the template before the first bulk request
    pub auto_register_template: bool,
    /// Primary shards in the template
    pub number_of_shards: u32,
    /// Replicas in the template
    pub number_of_replicas: u32,
    /// Entries per bulk request
    pub batch_size: usize,
    /// Maximum buffered entries; newer entries are dropped beyond this
    pub buffer_size: usize,
    /// Period of the background flush
    pub flush_interval: Duration,
    /// Breaker guarding the cluster
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ElasticsearchSinkConfig {
    /// Create a config for the given cluster and index.
    #[must_use]
    pub fn new(uri: Url, index_name: impl Into<String>) -> Self {
        Self {
            uri,
            index_name: index_name.into(),
            template_name: "applogs-events-template".to_string(),
            index_pattern: "applogs-*".to_string(),
            auto_register_template: true,
            number_of_shards: 2,
            number_of_replicas: 1,
            batch_size: 50,
            buffer_size: 10_000,
            flush_interval: Duration::from_secs(2),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    /// Create config with custom batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Create config with custom buffer size.
    #[must_use]
    pub const fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Create config with custom flush interval.
    #[must_use]
    pub const fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Skip index template registration.
    #[must_use]
    pub const fn without_template(mut self) -> Self {
        self.auto_register_template = false;
        self
    }

    /// Create config with a custom circuit breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

struct SinkInner {
    config: ElasticsearchSinkConfig,
    enrichment: Enrichment,
    client: Client,
    buffer: Mutex<VecDeque<LogEntry>>,
    circuit_breaker: CircuitBreaker,
    template_registered: AtomicBool,
    dropped: AtomicU64,
    batch_ready: Notify,
}

/// Buffered Elasticsearch writer. Clones share one buffer.
#[derive(Clone)]
pub struct ElasticsearchSink {
    inner: Arc<SinkInner>,
}

impl fmt::Debug for ElasticsearchSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticsearchSink")
            .field("uri", &self.inner.config.uri.as_str())
            .field("index_name", &self.inner.config.index_name)
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}

impl ElasticsearchSink {
    /// Create a sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ElasticsearchSinkConfig, enrichment: Enrichment) -> Result<Self, PipelineError> {
        let client = build_http_client(&HttpConfig::default().with_timeout(Duration::from_secs(30)))?;
        let circuit_breaker = CircuitBreaker::new("elasticsearch", config.circuit_breaker.clone());
        Ok(Self {
            inner: Arc::new(SinkInner {
                buffer: Mutex::new(VecDeque::with_capacity(config.batch_size)),
                config,
                enrichment,
                client,
                circuit_breaker,
                template_registered: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                batch_ready: Notify::new(),
            }),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ElasticsearchSinkConfig {
        &self.inner.config
    }

    /// Breaker guarding the cluster.
    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.circuit_breaker
    }

    /// Buffer an entry. Dropped when the buffer is full.
    pub fn push(&self, entry: LogEntry) {
        let len = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.len() >= self.inner.config.buffer_size {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            buffer.push_back(entry);
            buffer.len()
        };

        if len >= self.inner.config.batch_size {
            self.inner.batch_ready.notify_one();
        }
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Snapshot of the buffered entries, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<LogEntry> {
        self.inner.buffer.lock().iter().cloned().collect()
    }

    /// Entries discarded because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Ship everything buffered, one bulk request per batch.
    ///
    /// # Errors
    ///
    /// Returns the first delivery failure; the failed batch and everything
    /// behind it stay buffered.
    pub async fn flush(&self) -> Result<usize, PipelineError> {
        let mut shipped = 0;
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                return Ok(shipped);
            }

            if let Err(err) = self.ship(&batch).await {
                self.requeue(batch);
                return Err(err);
            }
            shipped += batch.len();
        }
    }

    fn take_batch(&self) -> Vec<LogEntry> {
        let mut buffer = self.inner.buffer.lock();
        let n = buffer.len().min(self.inner.config.batch_size);
        buffer.drain(..n).collect()
    }

    fn requeue(&self, batch: Vec<LogEntry>) {
        let mut buffer = self.inner.buffer.lock();
        for entry in batch.into_iter().rev() {
            buffer.push_front(entry);
        }
        while buffer.len() > self.inner.config.buffer_size {
            buffer.pop_back();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn ship(&self, batch: &[LogEntry]) -> Result<(), PipelineError> {
        self.inner.circuit_breaker.try_acquire()?;

        let result = match self.ensure_template().await {
            Ok(()) => self.post_bulk(batch).await,
            Err(err) => Err(err),
        };
        match &result {
            Ok(()) => self.inner.circuit_breaker.record_success(),
            Err(_) => self.inner.circuit_breaker.record_failure(),
        }
        result
    }

    /// Register the index template once.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is unreachable or rejects the template.
    pub async fn ensure_template(&self) -> Result<(), PipelineError> {
        let config = &self.inner.config;
        if !config.auto_register_template || self.inner.template_registered.load(Ordering::Acquire) {
            return Ok(());
        }

        let url = endpoint(&config.uri, &format!("_template/{}", config.template_name))?;
        let body = template_body(config);
        let response = self
            .inner
            .client
            .put(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::UnexpectedStatus { status, url });
        }

        self.inner.template_registered.store(true, Ordering::Release);
        debug!(template = %config.template_name, "Registered index template");
        Ok(())
    }

    async fn post_bulk(&self, batch: &[LogEntry]) -> Result<(), PipelineError> {
        let url = endpoint(&self.inner.config.uri, "_bulk")?;
        let body = bulk_body(&self.inner.config.index_name, batch)?;
        let response = self
            .inner
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"))
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::UnexpectedStatus { status, url });
        }

        // Item-level rejections are not retried; re-sending would fail the same way.
        let reply: Value = response.json().await.map_err(|e| transport_error(&url, e))?;
        if reply.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            warn!(count = batch.len(), "Elasticsearch rejected some log documents");
        }
        Ok(())
    }

    /// Flush every `flush_interval`, or sooner once a batch is full, until
    /// `shutdown` fires; then flush one last time.
    #[must_use]
    pub fn spawn_flush_task(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sink.inner.config.flush_interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                    () = sink.inner.batch_ready.notified() => {}
                }
                if let Err(err) = sink.flush().await {
                    debug!(error = %err, buffered = sink.buffered(), "Log flush failed");
                }
            }
            if let Err(err) = sink.flush().await {
                warn!(error = %err, buffered = sink.buffered(), "Final log flush failed");
            }
        })
    }

    /// Layer feeding this sink from the tracing pipeline.
    #[must_use]
    pub fn layer(&self) -> ElasticsearchLayer {
        ElasticsearchLayer { sink: self.clone() }
    }
}

/// Render NDJSON for the bulk API: an action line, then the document.
///
/// # Errors
///
/// Returns an error if an entry cannot be serialized.
pub fn bulk_body(index_name: &str, entries: &[LogEntry]) -> Result<String, PipelineError> {
    let action = serde_json::to_string(&json!({ "index": { "_index": index_name } }))?;
    let mut body = String::new();
    for entry in entries {
        body.push_str(&action);
        body.push('\n');
        body.push_str(&serde_json::to_string(entry)?);
        body.push('\n');
    }
    Ok(body)
}

fn template_body(config: &ElasticsearchSinkConfig) -> Value {
    json!({
        "index_patterns": [config.index_pattern],
        "settings": {
            "number_of_shards": config.number_of_shards,
            "number_of_replicas": config.number_of_replicas
        },
        "mappings": {
            "properties": {
                "@timestamp": { "type": "date" },
                "level": { "type": "keyword" },
                "message": { "type": "text" },
                "target": { "type": "keyword" }
            }
        }
    })
}

fn endpoint(base: &Url, path: &str) -> Result<Url, PipelineError> {
    join_under(base, path)
        .map_err(|e| PipelineError::Configuration(format!("invalid Elasticsearch endpoint {path}: {e}")))
}

/// `tracing` layer that buffers events into an [`ElasticsearchSink`].
#[derive(Debug, Clone)]
pub struct ElasticsearchLayer {
    sink: ElasticsearchSink,
}

#[derive(Debug, Default)]
struct SpanFields(BTreeMap<String, Value>);

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: BTreeMap<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, json!(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, json!(value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.insert(field, Value::String(rendered));
        }
    }
}

impl<S> Layer<S> for ElasticsearchLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut visitor = JsonVisitor::default();
        values.record(&mut visitor);
        let mut extensions = span.extensions_mut();
        if let Some(fields) = extensions.get_mut::<SpanFields>() {
            fields.0.extend(visitor.fields);
            return;
        }
        extensions.insert(SpanFields(visitor.fields));
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if IGNORED_TARGETS.iter().any(|ignored| target.starts_with(ignored)) {
            return;
        }

        let mut fields = BTreeMap::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(span_fields) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.0.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        if target.starts_with(BREAKER_TARGET)
            && visitor.fields.get("circuit").and_then(Value::as_str) == Some(self.sink.circuit_breaker().name())
        {
            return;
        }
        fields.extend(visitor.fields);

        let critical = fields.get("severity").and_then(Value::as_str) == Some("critical");
        self.sink.inner.enrichment.apply(&mut fields);

        self.sink.push(LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::from_tracing(*metadata.level(), critical),
            message: visitor.message.unwrap_or_default(),
            target: target.to_string(),
            fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn enrichment() -> Enrichment {
        Enrichment {
            application: "Shopping.Aggregator".to_string(),
            environment: "Development".to_string(),
            machine_name: "host-1".to_string(),
        }
    }

    fn sink(config: ElasticsearchSinkConfig) -> ElasticsearchSink {
        ElasticsearchSink::new(config, enrichment()).unwrap()
    }

    fn config() -> ElasticsearchSinkConfig {
        ElasticsearchSinkConfig::new(
            Url::parse("http://localhost:9200").unwrap(),
            "applogs-shopping-aggregator-development-2024-05",
        )
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(LogLevel::from_tracing(Level::TRACE, false), LogLevel::Verbose);
        assert_eq!(LogLevel::from_tracing(Level::INFO, false), LogLevel::Information);
        assert_eq!(LogLevel::from_tracing(Level::WARN, true), LogLevel::Warning);
        assert_eq!(LogLevel::from_tracing(Level::ERROR, false), LogLevel::Error);
        assert_eq!(LogLevel::from_tracing(Level::ERROR, true), LogLevel::Fatal);
    }

    #[test]
    fn test_default_config() {
        let config = config();
        assert_eq!(config.number_of_shards, 2);
        assert_eq!(config.number_of_replicas, 1);
        assert_eq!(config.index_pattern, "applogs-*");
        assert!(config.auto_register_template);
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let base = Url::parse("http://es.local:9200/proxy").unwrap();
        assert_eq!(endpoint(&base, "_bulk").unwrap().as_str(), "http://es.local:9200/proxy/_bulk");

        let base = Url::parse("http://es.local:9200").unwrap();
        assert_eq!(
            endpoint(&base, "_template/applogs-events-template").unwrap().as_str(),
            "http://es.local:9200/_template/applogs-events-template"
        );
    }

    #[test]
    fn test_bulk_body_is_ndjson() {
        let entries = vec![
            LogEntry::new(LogLevel::Information, "first", "shopping"),
            LogEntry::new(LogLevel::Warning, "second", "shopping").with_field("status_code", 503),
        ];
        let body = bulk_body("applogs-x", &entries).unwrap();
        let lines: Vec<&str> = body.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'));
        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "applogs-x");
        let doc: Value = serde_json::from_str(lines[3]).unwrap();
        assert_eq!(doc["level"], "Warning");
        assert_eq!(doc["message"], "second");
        assert_eq!(doc["fields"]["status_code"], 503);
        assert!(doc.get("@timestamp").is_some());
    }

    #[test]
    fn test_push_respects_buffer_size() {
        let sink = sink(config().with_buffer_size(2));
        for i in 0..5 {
            sink.push(LogEntry::new(LogLevel::Debug, format!("m{i}"), "t"));
        }
        assert_eq!(sink.buffered(), 2);
        assert_eq!(sink.dropped(), 3);
        assert_eq!(sink.pending()[0].message, "m0");
    }

    #[test]
    fn test_requeue_keeps_order() {
        let sink = sink(config().with_batch_size(2));
        for i in 0..3 {
            sink.push(LogEntry::new(LogLevel::Debug, format!("m{i}"), "t"));
        }
        let batch = sink.take_batch();
        assert_eq!(batch.len(), 2);
        sink.requeue(batch);

        let order: Vec<String> = sink.pending().into_iter().map(|e| e.message).collect();
        assert_eq!(order, ["m0", "m1", "m2"]);
    }

    #[test]
    fn test_layer_captures_events_with_enrichment() {
        let sink = sink(config());
        let subscriber = tracing_subscriber::registry().with(sink.layer());

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("outbound_request", client = "basket");
            let _guard = span.enter();
            tracing::error!(
                target: "shopping_aggregator",
                severity = "critical",
                host = "localhost:8001",
                "Unable to connect to localhost:8001"
            );
            tracing::warn!(target: "reqwest::connect", "ignored");
            tracing::warn!("sink diagnostics");
        });

        let pending = sink.pending();
        assert_eq!(pending.len(), 1);
        let entry = &pending[0];
        assert_eq!(entry.level, LogLevel::Fatal);
        assert_eq!(entry.message, "Unable to connect to localhost:8001");
        assert_eq!(entry.fields["client"], "basket");
        assert_eq!(entry.fields["host"], "localhost:8001");
        assert_eq!(entry.fields["Application"], "Shopping.Aggregator");
        assert_eq!(entry.fields["MachineName"], "host-1");
        assert_eq!(entry.target, "shopping_aggregator");
    }

    #[test]
    fn test_layer_skips_own_breaker_transitions() {
        let sink = sink(config());
        let subscriber = tracing_subscriber::registry().with(sink.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(
                target: "outbound_pipeline::circuit_breaker",
                circuit = "elasticsearch",
                "Circuit opened due to consecutive failures"
            );
            tracing::warn!(
                target: "outbound_pipeline::circuit_breaker",
                circuit = "basket",
                "Circuit opened due to consecutive failures"
            );
        });

        let pending = sink.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].fields["circuit"], "basket");
    }
}
