//! Shopping Aggregator - Main Entry Point

use anyhow::Context;
use outbound_pipeline::{CancellationToken, init_logging};
use shopping_aggregator::{AppState, Config, HealthCheckService, ServiceClients, router, serve, shutdown_on_signal};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    let logging = init_logging(&config.logging_config()).context("initializing logging")?;

    let shutdown = CancellationToken::new();
    let flush_task = logging.spawn_background_flush(shutdown.clone());

    info!(
        environment = %config.environment,
        index = %logging.index_name(),
        "Starting Shopping Aggregator"
    );

    let clients = ServiceClients::new(&config, &logging).context("building downstream clients")?;
    let health = HealthCheckService::for_clients(&clients, config.health_timeout());
    let app = router(AppState::new(health));

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("binding {}", config.bind_address()))?;

    tokio::spawn(shutdown_on_signal(shutdown.clone()));
    let served = serve(listener, app, shutdown.clone()).await;

    shutdown.cancel();
    if let Some(task) = flush_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Log flush task failed");
        }
    }

    info!("Shopping Aggregator stopped");
    served.context("serving HTTP")
}
