//! Order fulfillment server entry point.

use std::sync::Arc;

use server::config::{Config, LogFormat};
use server::wiring::{build_services, spawn_workers};
use server::{AppState, create_app};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);
    config.check();

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let services = build_services(&config)
        .await
        .expect("failed to initialize backends");
    tracing::info!(
        store = services.backends.store,
        admission = services.backends.admission,
        "backends ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(
        &config,
        &services.saga,
        Arc::clone(&services.bus),
        services.receiver,
        Arc::clone(&services.delays),
        &shutdown_rx,
    );
    drop(shutdown_rx);

    let state = Arc::new(AppState {
        backends: services.backends,
        publisher: Arc::clone(&services.publisher),
    });
    let app = create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    if shutdown_tx.send(true).is_err() {
        tracing::warn!("no worker was listening for shutdown");
    }
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "worker task failed");
        }
    }

    tracing::info!("server shut down gracefully");
}
