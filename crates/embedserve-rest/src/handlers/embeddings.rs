//! Embedding generation handler.

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use embedserve_core::EmbeddingResponse;
use embedserve_service::EmbeddingRequest;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

/// `input` accepts either one document or a list of documents.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

impl From<EmbeddingInput> for Vec<String> {
    fn from(input: EmbeddingInput) -> Self {
        match input {
            EmbeddingInput::Single(text) => vec![text],
            EmbeddingInput::Batch(texts) => texts,
        }
    }
}

/// Request payload for `POST /v1/embeddings`.
#[derive(Debug, Deserialize)]
pub struct EmbeddingsBody {
    pub input: EmbeddingInput,

    /// Model name or alias
    pub model: String,

    /// Optional L2 normalization (default: false)
    #[serde(default)]
    pub normalize: bool,
}

impl From<EmbeddingsBody> for EmbeddingRequest {
    fn from(body: EmbeddingsBody) -> Self {
        Self {
            input: body.input.into(),
            model: body.model,
            normalize: body.normalize,
        }
    }
}

/// POST /v1/embeddings - embed documents, splitting long ones into chunks
///
/// # Request
///
/// ```json
/// {
///   "input": ["Hello world", "A much longer document ..."],
///   "model": "all-MiniLM-L6-v2",
///   "normalize": false
/// }
/// ```
///
/// # Response
///
/// ```json
/// {
///   "object": "list",
///   "data": [
///     {"object": "embedding", "index": 0, "chunk_index": 0, "embedding": [0.01, ...]},
///     {"object": "embedding", "index": 1, "chunk_index": 0, "embedding": [0.02, ...]},
///     {"object": "embedding", "index": 1, "chunk_index": 1, "embedding": [0.03, ...]}
///   ],
///   "model": "sentence-transformers/all-MiniLM-L6-v2",
///   "usage": {"prompt_tokens": 312, "total_tokens": 338, "chunks": 3}
/// }
/// ```
///
/// Partially failed requests still return 200 and list the failed items
/// under `errors`.
#[tracing::instrument(skip(state, body))]
pub async fn embeddings_handler(
    State(state): State<AppState>,
    body: Result<Json<EmbeddingsBody>, JsonRejection>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let Json(body) = body?;
    let request = EmbeddingRequest::from(body);

    tracing::debug!(
        documents = request.input.len(),
        model = %request.model,
        normalize = request.normalize,
        "Embedding request"
    );

    let response = state.service.embed(request).await?;
    Ok(Json(response))
}
