use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for backend operations.
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    /// Model artifacts not found or not loadable.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Text could not be tokenized (encoding errors, unsupported input).
    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    /// Invalid input (empty batch, mismatched shapes, etc.).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backend ran out of memory or another bounded resource.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Service unavailable or unhealthy.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal error during embedding generation.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for backend operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Input of one forward pass: token-id sequences plus their true lengths.
///
/// `lengths[i] <= sequences[i].len()`; anything past `lengths[i]` is padding
/// and must be masked out by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForwardBatch {
    pub sequences: Vec<Vec<u32>>,
    pub lengths: Vec<usize>,
}

impl ForwardBatch {
    /// Builds an unpadded batch.
    #[must_use]
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        let lengths = sequences.iter().map(Vec::len).collect();
        Self { sequences, lengths }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Widest sequence in the batch.
    #[must_use]
    pub fn width(&self) -> usize {
        self.sequences.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// True when every sequence has the same width.
    #[must_use]
    pub fn is_rectangular(&self) -> bool {
        let width = self.width();
        self.sequences.iter().all(|s| s.len() == width)
    }

    /// Right-pads every sequence with `pad_id` to the batch width.
    #[must_use]
    pub fn padded(mut self, pad_id: u32) -> Self {
        let width = self.width();
        for sequence in &mut self.sequences {
            sequence.resize(width, pad_id);
        }
        self
    }

    /// Attention mask (1 for real tokens, 0 for padding) per sequence.
    #[must_use]
    pub fn attention_mask(&self) -> Vec<Vec<u8>> {
        self.sequences
            .iter()
            .zip(&self.lengths)
            .map(|(sequence, &len)| {
                (0..sequence.len())
                    .map(|i| u8::from(i < len))
                    .collect()
            })
            .collect()
    }

    /// Real (unpadded) tokens of sequence `i`.
    #[must_use]
    pub fn tokens(&self, i: usize) -> &[u32] {
        &self.sequences[i][..self.lengths[i]]
    }

    /// Splits into `[0, mid)` and `[mid, len)`.
    #[must_use]
    pub fn split_at(self, mid: usize) -> (Self, Self) {
        let mut sequences = self.sequences;
        let mut lengths = self.lengths;
        let tail_sequences = sequences.split_off(mid);
        let tail_lengths = lengths.split_off(mid);
        (
            Self { sequences, lengths },
            Self {
                sequences: tail_sequences,
                lengths: tail_lengths,
            },
        )
    }
}

/// Static limits of a loaded backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Model identifier.
    pub model: String,
    /// Output dimension of embeddings.
    pub dimension: usize,
    /// Maximum input tokens per sequence.
    pub max_sequence_length: usize,
}
