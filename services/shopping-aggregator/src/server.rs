//! HTTP surface of the aggregator.

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::health::HealthCheckService;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Downstream health checks
    pub health: Arc<HealthCheckService>,
}

impl AppState {
    /// Wrap a health service.
    #[must_use]
    pub fn new(health: HealthCheckService) -> Self {
        Self {
            health: Arc::new(health),
        }
    }
}

/// Routes served by the aggregator.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new().route("/hc", get(health_check)).with_state(state)
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.run().await;
    (report.status.http_status(), Json(report))
}

/// Serve until `shutdown` is cancelled, then drain in-flight requests.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Cancel `shutdown` on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_on_signal(shutdown: CancellationToken) {
    cancel_on(wait_for_signal(), shutdown).await;
}

/// Cancel `shutdown` once `signal` resolves, unless it is cancelled first.
pub async fn cancel_on<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = &'static str>,
{
    tokio::select! {
        name = signal => {
            info!(signal = name, "Received {}, initiating shutdown", name);
            shutdown.cancel();
        }
        () = shutdown.cancelled() => {}
    }
}

/// Resolves on the first shutdown signal. A listener that cannot be
/// installed is logged and never fires.
async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => "Ctrl+C",
            Err(e) => {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    }
}
