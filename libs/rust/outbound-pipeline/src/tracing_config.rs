//! Logging configuration and the shared logging context.
//!
//! [`init_logging`] installs the process-wide subscriber once at startup:
//! an `EnvFilter`, a console formatter and, when a cluster is configured,
//! the Elasticsearch layer. The [`LoggingContext`] it returns is handed
//! explicitly to every component that stamps or ships log data.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use crate::PipelineError;
use crate::elastic_sink::{ElasticsearchSink, ElasticsearchSinkConfig, Enrichment};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Application name, stamped on every shipped document
    pub application: String,
    /// Environment name (Development, Staging, Production, ...)
    pub environment: String,
    /// Log level filter, overridden by `RUST_LOG`
    pub log_level: String,
    /// Whether to output JSON format on the console
    pub json_output: bool,
    /// Elasticsearch cluster; no sink when absent
    pub elastic_uri: Option<Url>,
    /// Host name override
    pub machine_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            application: "rust-service".to_string(),
            environment: "Development".to_string(),
            log_level: "info".to_string(),
            json_output: false,
            elastic_uri: None,
            machine_name: None,
        }
    }
}

impl LoggingConfig {
    /// Create config with custom application name.
    #[must_use]
    pub fn with_application(mut self, name: impl Into<String>) -> Self {
        self.application = name.into();
        self
    }

    /// Create config with custom environment name.
    #[must_use]
    pub fn with_environment(mut self, name: impl Into<String>) -> Self {
        self.environment = name.into();
        self
    }

    /// Create config with custom log level.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enable JSON output.
    #[must_use]
    pub const fn with_json_output(mut self) -> Self {
        self.json_output = true;
        self
    }

    /// Ship logs to an Elasticsearch cluster.
    #[must_use]
    pub fn with_elastic_uri(mut self, uri: Url) -> Self {
        self.elastic_uri = Some(uri);
        self
    }

    /// Override the detected host name.
    #[must_use]
    pub fn with_machine_name(mut self, name: impl Into<String>) -> Self {
        self.machine_name = Some(name.into());
        self
    }
}

/// `applogs-{application}-{environment}-{yyyy-MM}`, lower-cased with dots
/// replaced by dashes.
#[must_use]
pub fn index_name(application: &str, environment: &str, now: DateTime<Utc>) -> String {
    fn normalize(name: &str) -> String {
        name.to_lowercase().replace('.', "-")
    }

    format!(
        "applogs-{}-{}-{}",
        normalize(application),
        normalize(environment),
        now.format("%Y-%m")
    )
}

#[derive(Debug)]
struct ContextInner {
    application: String,
    environment: String,
    machine_name: String,
    index_name: String,
    sink: Option<ElasticsearchSink>,
}

/// Application identity and log sink, shared by the components that log.
#[derive(Debug, Clone)]
pub struct LoggingContext {
    inner: Arc<ContextInner>,
}

impl LoggingContext {
    /// Build a context without installing a global subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the Elasticsearch sink cannot be created.
    pub fn new(config: &LoggingConfig) -> Result<Self, PipelineError> {
        let machine_name = config
            .machine_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| std::env::var("COMPUTERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string());
        let index_name = index_name(&config.application, &config.environment, Utc::now());

        let sink = match &config.elastic_uri {
            Some(uri) => {
                let enrichment = Enrichment {
                    application: config.application.clone(),
                    environment: config.environment.clone(),
                    machine_name: machine_name.clone(),
                };
                let sink_config = ElasticsearchSinkConfig::new(uri.clone(), index_name.clone());
                Some(ElasticsearchSink::new(sink_config, enrichment)?)
            }
            None => None,
        };

        Ok(Self {
            inner: Arc::new(ContextInner {
                application: config.application.clone(),
                environment: config.environment.clone(),
                machine_name,
                index_name,
                sink,
            }),
        })
    }

    /// Application name.
    #[must_use]
    pub fn application(&self) -> &str {
        &self.inner.application
    }

    /// Environment name.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.inner.environment
    }

    /// Host name.
    #[must_use]
    pub fn machine_name(&self) -> &str {
        &self.inner.machine_name
    }

    /// Index the sink writes to, fixed at startup.
    #[must_use]
    pub fn index_name(&self) -> &str {
        &self.inner.index_name
    }

    /// Elasticsearch sink, if one is configured.
    #[must_use]
    pub fn sink(&self) -> Option<&ElasticsearchSink> {
        self.inner.sink.as_ref()
    }

    /// Ship buffered log entries. A no-op without a sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster cannot be reached.
    pub async fn flush(&self) -> Result<usize, PipelineError> {
        match &self.inner.sink {
            Some(sink) => sink.flush().await,
            None => Ok(0),
        }
    }

    /// Start the periodic flush task, if a sink is configured.
    #[must_use]
    pub fn spawn_background_flush(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        self.inner.sink.as_ref().map(|sink| sink.spawn_flush_task(shutdown))
    }
}

/// Initialize logging with the given configuration.
///
/// This sets up the global tracing subscriber with the specified configuration.
/// Should be called once at application startup.
///
/// # Errors
///
/// Returns an error if the sink cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingContext, PipelineError> {
    let context = LoggingContext::new(config)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json_output.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.json_output).then(tracing_subscriber::fmt::layer))
        .with(context.sink().map(ElasticsearchSink::layer))
        .try_init()
        .map_err(|e| PipelineError::Configuration(format!("failed to install subscriber: {e}")))?;

    Ok(context)
}
