//! Service wiring for the order fulfillment backbone.
//!
//! Selects the storage backends, starts the saga's background workers and
//! serves `/health` and `/metrics` with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod wiring;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::TransactionalPublisher;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use wiring::Backends;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub backends: Backends,
    pub publisher: Arc<TransactionalPublisher>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
