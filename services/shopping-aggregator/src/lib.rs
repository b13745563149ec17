//! Shopping Aggregator Service
//!
//! Fronts the catalog, basket and ordering APIs through resilient typed
//! clients and reports their health on `/hc`.

pub mod clients;
pub mod config;
pub mod health;
pub mod server;

pub use clients::ServiceClients;
pub use config::{APPLICATION_NAME, Config, ConfigError};
pub use health::{HealthCheck, HealthCheckResult, HealthCheckService, HealthReport, HealthStatus, UrlHealthCheck};
pub use server::{AppState, cancel_on, router, serve, shutdown_on_signal};
