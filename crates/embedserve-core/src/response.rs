use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

fn embedding_object() -> String {
    "embedding".to_string()
}

fn list_object() -> String {
    "list".to_string()
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One embedding for one chunk of one input document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseItem {
    #[serde(default = "embedding_object")]
    pub object: String,
    /// `input_index` of the source document.
    pub index: usize,
    /// Position of the chunk within its document.
    pub chunk_index: usize,
    pub embedding: Vec<f32>,
    /// Set when normalization was requested but the vector had zero norm.
    #[serde(default, skip_serializing_if = "is_false")]
    pub zero_norm: bool,
}

impl ResponseItem {
    #[must_use]
    pub fn new(index: usize, chunk_index: usize, embedding: Vec<f32>) -> Self {
        Self {
            object: embedding_object(),
            index,
            chunk_index,
            embedding,
            zero_norm: false,
        }
    }
}

/// Per-item failure marker.
///
/// `chunk_index` is `None` for document-scoped failures (tokenization), where
/// no chunks could be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub index: usize,
    pub chunk_index: Option<usize>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Token and chunk accounting for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens across all successfully tokenized documents.
    pub prompt_tokens: usize,
    /// Tokens submitted to the backend, overlap included.
    pub total_tokens: usize,
    /// Chunks produced for the request.
    pub chunks: usize,
}

/// Assembled response for one embedding request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    #[serde(default = "list_object")]
    pub object: String,
    /// Items ordered by `(index, chunk_index)`.
    pub data: Vec<ResponseItem>,
    pub model: String,
    pub usage: Usage,
    /// Items that failed while others succeeded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ItemError>,
}

impl EmbeddingResponse {
    #[must_use]
    pub fn new(model: impl Into<String>, data: Vec<ResponseItem>, usage: Usage) -> Self {
        Self {
            object: list_object(),
            data,
            model: model.into(),
            usage,
            errors: Vec::new(),
        }
    }

    /// True when at least one item failed.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}
