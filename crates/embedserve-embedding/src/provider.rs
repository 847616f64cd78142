use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{BackendInfo, EmbeddingResult, ForwardBatch};

/// Capability interface of a loaded embedding model.
///
/// Implementations wrap a tokenizer and a forward computation. Both calls are
/// synchronous and may block; the pipeline calls `tokenize` on the blocking
/// pool and runs `forward` on a bounded worker pool, never concurrently more
/// often than the pool allows.
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier reported by the backend.
    fn name(&self) -> &str;

    /// Converts text into token ids.
    ///
    /// # Errors
    ///
    /// Returns `EmbeddingError::Tokenization` when the text cannot be encoded.
    fn tokenize(&self, text: &str) -> EmbeddingResult<Vec<u32>>;

    /// Runs the model on a batch, returning one vector per sequence in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the computation fails (e.g. resource exhaustion).
    fn forward(&self, batch: &ForwardBatch) -> EmbeddingResult<Vec<Vec<f32>>>;

    /// Maximum tokens per sequence.
    fn max_sequence_length(&self) -> usize;

    /// Output vector dimension.
    fn embedding_dim(&self) -> usize;

    /// Whether every sequence of a batch must have the same width.
    fn requires_fixed_shape(&self) -> bool {
        false
    }

    /// Token id used for padding when `requires_fixed_shape` is set.
    fn pad_token_id(&self) -> u32 {
        0
    }

    /// Static limits of the backend.
    fn info(&self) -> BackendInfo {
        BackendInfo {
            model: self.name().to_string(),
            dimension: self.embedding_dim(),
            max_sequence_length: self.max_sequence_length(),
        }
    }
}

/// Asynchronous source of a backend.
///
/// The model registry calls `load` once per registration in a background task.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Loads model artifacts and returns a ready backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifacts are missing or invalid; the registry
    /// then marks the handle `Failed`.
    async fn load(&self) -> EmbeddingResult<Arc<dyn EmbeddingBackend>>;
}
