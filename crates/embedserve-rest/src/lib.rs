//! HTTP surface of embedserve.

pub mod error;
pub mod handlers;
pub mod state;
pub mod tracing_init;

pub use error::ApiError;
pub use state::AppState;

use axum::{
    extract::Request,
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{classify::ServerErrorsFailureClass, trace::TraceLayer};
use tracing::{info_span, Span};
use uuid::Uuid;

/// Builds the router hosting the embedserve REST API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health checks and metrics
        .route("/alive", get(handlers::alive_handler))
        .route("/ready", get(handlers::ready_handler))
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        // Model metadata
        .route("/v1/info", get(handlers::info_handler))
        .route("/v1/models", get(handlers::list_models_handler))
        // Inference
        .route("/v1/embeddings", post(handlers::embeddings_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request| {
                    let request_id = Uuid::new_v4();
                    info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_request(|_request: &Request, _span: &Span| {
                    tracing::debug!("started processing request");
                })
                .on_response(|response: &Response, latency: std::time::Duration, _span: &Span| {
                    let status = response.status();
                    let latency_ms = latency.as_millis();

                    if status.is_server_error() {
                        tracing::error!(status = %status, latency_ms = latency_ms, "request failed with server error");
                    } else if status.is_client_error() {
                        tracing::warn!(status = %status, latency_ms = latency_ms, "request failed with client error");
                    } else {
                        tracing::info!(status = %status, latency_ms = latency_ms, "request completed");
                    }
                })
                .on_failure(|failure_class: ServerErrorsFailureClass, latency: std::time::Duration, _span: &Span| {
                    tracing::error!(failure_class = ?failure_class, latency_ms = latency.as_millis(), "request failed");
                }),
        )
}
