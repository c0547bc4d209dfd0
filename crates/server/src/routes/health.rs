//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;
use crate::wiring::Backends;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backends: Backends,
    /// Checkout events prepared but not yet delivered. Absent when the
    /// outbox cannot be read.
    pub pending_messages: Option<usize>,
}

/// GET /health: reports the configured backends and the outbox backlog.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pending_messages = match state.publisher.pending_count().await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "Outbox backlog unavailable");
            None
        }
    };
    Json(HealthResponse {
        status: "ok",
        backends: state.backends,
        pending_messages,
    })
}
