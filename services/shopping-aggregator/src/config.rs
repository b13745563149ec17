//! Type-Safe Configuration with Validation
//!
//! Loads downstream addresses, resilience settings and logging options from
//! environment variables, with defaults for local development.

use std::env;
use std::time::Duration;

use outbound_pipeline::{CircuitBreakerConfig, LoggingConfig, RetryConfig, RetryPolicy};
use thiserror::Error;
use url::Url;

/// Application name stamped on logs.
pub const APPLICATION_NAME: &str = "Shopping.Aggregator";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid URL format
    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl {
        /// Variable name
        field: String,
        /// Parser message
        reason: String,
    },

    /// Invalid port number
    #[error("Invalid port: must be between 1 and 65535")]
    InvalidPort,

    /// Invalid threshold value
    #[error("Invalid threshold: must be greater than 0")]
    InvalidThreshold,

    /// Zero duration where a positive one is required
    #[error("Invalid duration for {0}: must be greater than 0")]
    InvalidDuration(String),

    /// Environment variable parse error
    #[error("Failed to parse environment variable {name}: {reason}")]
    ParseError {
        /// Variable name
        name: String,
        /// Parser message
        reason: String,
    },
}

/// Service configuration with validation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port (1-65535)
    pub port: u16,
    /// Catalog API base URL
    pub catalog_url: Url,
    /// Basket API base URL
    pub basket_url: Url,
    /// Ordering API base URL
    pub ordering_url: Url,
    /// Elasticsearch cluster for log shipping
    pub elastic_uri: Option<Url>,
    /// Environment name
    pub environment: String,
    /// Log level filter
    pub log_level: String,
    /// JSON console output
    pub log_json: bool,
    /// Overall deadline for basket calls in seconds
    pub basket_timeout_secs: u64,
    /// Retries per call
    pub retry_count: u32,
    /// Base of the exponential backoff in seconds
    pub retry_base_delay_secs: u64,
    /// Circuit breaker failure threshold (must be > 0)
    pub circuit_breaker_failure_threshold: u32,
    /// Circuit breaker break duration in seconds
    pub circuit_breaker_break_secs: u64,
    /// Deadline for each health probe in seconds
    pub health_timeout_secs: u64,
}

impl Config {
    /// Loads configuration from environment variables with validation.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_source(|name| env::var(name).ok())
    }

    /// Loads configuration through an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or a value is invalid.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source(lookup);

        let config = Self {
            host: source.string("HOST", "0.0.0.0"),
            port: source.parse("PORT", 8005)?,
            catalog_url: source.url("CATALOG_URL", "http://localhost:8000")?,
            basket_url: source.url("BASKET_URL", "http://localhost:8001")?,
            ordering_url: source.url("ORDERING_URL", "http://localhost:8004")?,
            elastic_uri: source.optional_url("ELASTIC_URI")?,
            environment: source.string("APP_ENVIRONMENT", "Development"),
            log_level: source.string("LOG_LEVEL", "info"),
            log_json: source.parse("LOG_JSON", false)?,
            basket_timeout_secs: source.parse("BASKET_TIMEOUT", 4)?,
            retry_count: source.parse("RETRY_COUNT", 3)?,
            retry_base_delay_secs: source.parse("RETRY_BASE_DELAY", 1)?,
            circuit_breaker_failure_threshold: source.parse("CB_FAILURE_THRESHOLD", 5)?,
            circuit_breaker_break_secs: source.parse("CB_BREAK_DURATION", 30)?,
            health_timeout_secs: source.parse("HEALTH_TIMEOUT", 5)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.circuit_breaker_failure_threshold == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        for (name, value) in [
            ("BASKET_TIMEOUT", self.basket_timeout_secs),
            ("RETRY_BASE_DELAY", self.retry_base_delay_secs),
            ("CB_BREAK_DURATION", self.circuit_breaker_break_secs),
            ("HEALTH_TIMEOUT", self.health_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidDuration(name.to_string()));
            }
        }
        Ok(())
    }

    /// Address the HTTP server binds to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Deadline for basket calls.
    #[must_use]
    pub const fn basket_timeout(&self) -> Duration {
        Duration::from_secs(self.basket_timeout_secs)
    }

    /// Deadline for each health probe.
    #[must_use]
    pub const fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    /// Logging setup for this service.
    #[must_use]
    pub fn logging_config(&self) -> LoggingConfig {
        let mut logging = LoggingConfig::default()
            .with_application(APPLICATION_NAME)
            .with_environment(&self.environment)
            .with_log_level(&self.log_level);
        if self.log_json {
            logging = logging.with_json_output();
        }
        if let Some(uri) = &self.elastic_uri {
            logging = logging.with_elastic_uri(uri.clone());
        }
        logging
    }

    /// Retry policy for the named client.
    #[must_use]
    pub fn retry_policy(&self, client: &str) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::default()
                .with_max_retries(self.retry_count)
                .with_initial_delay(Duration::from_secs(self.retry_base_delay_secs))
                .with_policy_key(format!("{client}-retry")),
        )
    }

    /// Circuit breaker settings shared by every client.
    #[must_use]
    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.circuit_breaker_failure_threshold)
            .with_break_duration(Duration::from_secs(self.circuit_breaker_break_secs))
    }
}

struct Source<F>(F);

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str, default: &str) -> String {
        (self.0)(name).unwrap_or_else(|| default.to_string())
    }

    /// Parse a variable with a default value.
    fn parse<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match (self.0)(name) {
            Some(val) => val.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
                name: name.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    /// Parse a URL variable with a default value.
    fn url(&self, name: &str, default: &str) -> Result<Url, ConfigError> {
        let url_str = self.string(name, default);
        parse_url(name, &url_str)
    }

    fn optional_url(&self, name: &str) -> Result<Option<Url>, ConfigError> {
        match (self.0)(name) {
            Some(value) if !value.trim().is_empty() => parse_url(name, value.trim()).map(Some),
            _ => Ok(None),
        }
    }
}

fn parse_url(name: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field: name.to_string(),
        reason: e.to_string(),
    })
}
