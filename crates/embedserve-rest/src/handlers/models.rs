//! Model metadata endpoints.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use embedserve_core::ModelDescriptor;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Query string of `GET /v1/info`.
#[derive(Debug, Deserialize)]
pub struct InfoQuery {
    /// Model name or alias (default: "sentence-transformers/all-MiniLM-L6-v2")
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

fn default_model_name() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}

/// GET /v1/info?model_name=... - metadata of one model.
///
/// # Response
///
/// ```json
/// {
///   "name": "sentence-transformers/all-MiniLM-L6-v2",
///   "aliases": ["all-MiniLM-L6-v2"],
///   "status": "ready",
///   "max_sequence_length": 256,
///   "embedding_dim": 384
/// }
/// ```
///
/// Unknown names return 404.
#[tracing::instrument(skip(state, query))]
pub async fn info_handler(
    State(state): State<AppState>,
    query: Result<Query<InfoQuery>, QueryRejection>,
) -> Result<Json<ModelDescriptor>, ApiError> {
    let Query(query) = query?;
    let handle = state.service.registry().get(&query.model_name)?;
    Ok(Json(handle.descriptor()))
}

/// GET /v1/models - metadata of every registered model, sorted by name.
pub async fn list_models_handler(State(state): State<AppState>) -> Json<Vec<ModelDescriptor>> {
    Json(state.service.registry().descriptors())
}
