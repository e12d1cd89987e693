use std::future::ready;

use axum::{routing::get, Router};
use checkin_common::metrics::setup_metrics_routes;
use health::HealthRegistry;
use metrics_exporter_prometheus::BuildError;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber, filtered by `RUST_LOG` and defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Operational endpoints of the consumer binaries.
pub fn router(
    name: &'static str,
    liveness: HealthRegistry,
    metrics: bool,
) -> Result<Router, BuildError> {
    let router = Router::new()
        .route("/", get(move || ready(name)))
        .route("/_liveness", get(move || ready(liveness.get_status())));

    if metrics {
        setup_metrics_routes(router)
    } else {
        Ok(router)
    }
}

/// A token cancelled on the first SIGINT or SIGTERM.
pub fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {},
            _ = interrupt.recv() => {},
        };

        info!("Shutting down gracefully...");
        cancel.cancel();
    });

    Ok(token)
}
