//! Health check endpoints for Kubernetes liveness and readiness probes.
//!
//! # Endpoints
//!
//! - `GET /alive` - Liveness probe (is the process serving?)
//! - `GET /ready` - Readiness probe (are all models loaded?)
//! - `GET /health` - Detailed report with per-model status and counters

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::state::AppState;

/// Liveness probe handler.
///
/// Always returns 200 with `{"alive": true}` once the server is accepting
/// connections. Model load failures do not affect liveness.
///
/// # Kubernetes Configuration
///
/// ```yaml
/// livenessProbe:
///   httpGet:
///     path: /alive
///     port: 3000
///   initialDelaySeconds: 5
///   periodSeconds: 10
/// ```
pub async fn alive_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "alive": state.health.alive() })),
    )
}

/// Readiness probe handler.
///
/// Returns 200 with `{"ready": true}` when every registered model is ready,
/// 503 with `{"ready": false}` while any model is loading or has failed.
///
/// # Kubernetes Configuration
///
/// ```yaml
/// readinessProbe:
///   httpGet:
///     path: /ready
///     port: 3000
///   initialDelaySeconds: 5
///   periodSeconds: 5
///   failureThreshold: 3
/// ```
pub async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.health.ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready })))
}

/// GET /health - uptime, readiness and per-model status.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.report())
}
