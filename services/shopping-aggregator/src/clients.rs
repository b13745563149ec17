//! Typed clients for the downstream APIs.

use outbound_pipeline::{
    HttpConfig, HttpTransport, LoggingContext, OutboundRequest, OutboundResponse, PipelineBuilder, PipelineError,
    TypedClient,
};
use tower::Service;
use url::Url;

use crate::config::Config;

/// One typed client per downstream API.
#[derive(Debug, Clone)]
pub struct ServiceClients {
    /// Catalog API
    pub catalog: TypedClient,
    /// Basket API
    pub basket: TypedClient,
    /// Ordering API
    pub ordering: TypedClient,
}

impl ServiceClients {
    /// Build the clients over a shared reqwest transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config, logging: &LoggingContext) -> Result<Self, PipelineError> {
        let transport = HttpTransport::from_config(&HttpConfig::default())?;
        Ok(Self::with_transport(config, logging, transport))
    }

    /// Build the clients over any transport.
    ///
    /// Every client logs, retries and breaks its circuit; basket calls are
    /// additionally capped by the basket timeout.
    pub fn with_transport<T>(config: &Config, logging: &LoggingContext, transport: T) -> Self
    where
        T: Service<OutboundRequest, Response = OutboundResponse, Error = PipelineError>
            + Clone
            + Send
            + Sync
            + 'static,
        T::Future: Send + 'static,
    {
        let catalog = resilient("catalog", &config.catalog_url, config, logging).build(transport.clone());
        let basket = resilient("basket", &config.basket_url, config, logging)
            .with_timeout(config.basket_timeout())
            .build(transport.clone());
        let ordering = resilient("ordering", &config.ordering_url, config, logging).build(transport);

        Self {
            catalog,
            basket,
            ordering,
        }
    }

    /// All clients with their display names.
    #[must_use]
    pub fn named(&self) -> [(&'static str, &TypedClient); 3] {
        [
            ("Catalog API", &self.catalog),
            ("Basket API", &self.basket),
            ("Ordering API", &self.ordering),
        ]
    }
}

fn resilient(name: &str, base: &Url, config: &Config, logging: &LoggingContext) -> PipelineBuilder {
    PipelineBuilder::new(name, base.clone(), logging)
        .with_retry(config.retry_policy(name))
        .with_circuit_breaker(config.circuit_breaker_config())
}
