use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::response::ItemError;

/// Coarse classification of pipeline failures.
///
/// Carried on per-item error markers and used as the `kind` label of the
/// error counter, so the set is closed and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Tokenization,
    UnknownModel,
    ModelNotReady,
    ModelLoad,
    Overloaded,
    Inference,
    Validation,
    Timeout,
    NoViableChunks,
    Internal,
}

impl ErrorKind {
    /// Returns the canonical snake_case label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tokenization => "tokenization",
            Self::UnknownModel => "unknown_model",
            Self::ModelNotReady => "model_not_ready",
            Self::ModelLoad => "model_load",
            Self::Overloaded => "overloaded",
            Self::Inference => "inference",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::NoViableChunks => "no_viable_chunks",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical error type for the embedding pipeline.
///
/// Variants are scoped: `Tokenization` belongs to one document, `Inference`
/// and `Overloaded` may belong to a single chunk, `UnknownModel`,
/// `ModelNotReady`, `ModelLoad` and `Timeout` fail a whole request.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The backend could not tokenize a document.
    #[error("tokenization failed: {message}")]
    Tokenization {
        /// Backend-provided reason.
        message: String,
    },

    /// No model was ever registered under the requested name.
    #[error("model `{name}` is not registered")]
    UnknownModel {
        /// Requested model name.
        name: String,
    },

    /// The model is registered but still loading.
    #[error("model `{name}` is not ready (status: {status})")]
    ModelNotReady {
        /// Model name.
        name: String,
        /// Current lifecycle status label.
        status: String,
    },

    /// The model failed to load; the handle stays failed for the process lifetime.
    #[error("model `{name}` failed to load: {message}")]
    ModelLoad {
        /// Model name.
        name: String,
        /// Load failure reason.
        message: String,
    },

    /// The model's pending queue is full.
    #[error("model `{model}` is overloaded: pending queue depth {depth} reached")]
    Overloaded {
        /// Model name.
        model: String,
        /// Configured maximum queue depth.
        depth: usize,
    },

    /// The backend forward pass failed for this chunk's batch.
    #[error("inference failed: {message}")]
    Inference {
        /// Backend-provided reason.
        message: String,
    },

    /// Request was malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// Request exceeded its deadline; queued chunks are discarded on completion.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured request timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Every item of the request failed.
    #[error("no viable chunks: all {} item(s) failed", errors.len())]
    NoViableChunks {
        /// Per-item failures, ordered by `(index, chunk_index)`.
        errors: Vec<ItemError>,
    },

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },
}

impl PipelineError {
    /// Creates a `Tokenization` variant.
    #[must_use]
    pub fn tokenization(message: impl Into<String>) -> Self {
        Self::Tokenization {
            message: message.into(),
        }
    }

    /// Creates an `UnknownModel` variant.
    #[must_use]
    pub fn unknown_model(name: impl Into<String>) -> Self {
        Self::UnknownModel { name: name.into() }
    }

    /// Creates an `Inference` variant.
    #[must_use]
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the coarse classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Tokenization { .. } => ErrorKind::Tokenization,
            Self::UnknownModel { .. } => ErrorKind::UnknownModel,
            Self::ModelNotReady { .. } => ErrorKind::ModelNotReady,
            Self::ModelLoad { .. } => ErrorKind::ModelLoad,
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::Inference { .. } => ErrorKind::Inference,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NoViableChunks { .. } => ErrorKind::NoViableChunks,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Overloaded { .. } | Self::ModelNotReady { .. } | Self::Timeout { .. } => true,
            Self::NoViableChunks { errors } => errors
                .iter()
                .all(|e| matches!(e.kind, ErrorKind::Overloaded | ErrorKind::Timeout)),
            _ => false,
        }
    }
}

/// Convenient result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
