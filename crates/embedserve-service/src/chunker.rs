//! Token-window chunking of documents.
//!
//! A document longer than the model's `max_sequence_length` is split into
//! windows of exactly `max` tokens advancing by `max - overlap`. The final
//! window is shifted back so it ends at the document end, overlapping its
//! predecessor by more than the configured overlap when needed.

use embedserve_core::{Chunk, PipelineError, PipelineResult, TokenSpan};

/// Overlap between consecutive windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverlapPolicy {
    /// Fixed number of tokens.
    Tokens(usize),
    /// Fraction of `max_sequence_length`, in `[0, 1)`.
    Fraction(f32),
}

impl OverlapPolicy {
    /// Overlap in tokens for a model with `max` tokens per chunk.
    ///
    /// Always strictly below `max` so that windows advance.
    #[must_use]
    pub fn resolve(&self, max: usize) -> usize {
        let tokens = match *self {
            Self::Tokens(n) => n,
            Self::Fraction(f) => (max as f64 * f64::from(f.clamp(0.0, 1.0))).floor() as usize,
        };
        tokens.min(max.saturating_sub(1))
    }
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        Self::Fraction(0.1)
    }
}

/// Splits token sequences into overlapping, model-sized chunks. Pure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    overlap: OverlapPolicy,
}

impl Chunker {
    #[must_use]
    pub fn new(overlap: OverlapPolicy) -> Self {
        Self { overlap }
    }

    #[must_use]
    pub fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }

    /// Number of chunks for a document of `len` tokens.
    ///
    /// `overlap` is clamped to `max - 1`, as [`OverlapPolicy::resolve`] does.
    #[must_use]
    pub fn chunk_count(len: usize, max: usize, overlap: usize) -> usize {
        if len <= max {
            return 1;
        }
        let overlap = overlap.min(max.saturating_sub(1));
        let stride = (max - overlap).max(1);
        (len - overlap).div_ceil(stride)
    }

    /// Window spans covering `[0, len)`.
    #[must_use]
    pub fn spans(&self, len: usize, max: usize) -> Vec<TokenSpan> {
        if len <= max {
            return vec![TokenSpan::new(0, len)];
        }

        let overlap = self.overlap.resolve(max);
        let stride = max - overlap;
        let last_start = len - max;

        (0..Self::chunk_count(len, max, overlap))
            .map(|i| {
                let start = (i * stride).min(last_start);
                TokenSpan::new(start, start + max)
            })
            .collect()
    }

    /// Chunks one tokenized document.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Tokenization` when the document produced no
    /// tokens, and `PipelineError::Internal` for a zero `max`.
    pub fn chunk(&self, input_index: usize, token_ids: &[u32], max: usize) -> PipelineResult<Vec<Chunk>> {
        if max == 0 {
            return Err(PipelineError::internal("max_sequence_length must be positive"));
        }
        if token_ids.is_empty() {
            return Err(PipelineError::tokenization(format!(
                "input {input_index} produced no tokens"
            )));
        }

        Ok(self
            .spans(token_ids.len(), max)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, span)| Chunk {
                input_index,
                chunk_index,
                token_ids: token_ids[span.start..span.end].to_vec(),
                span,
            })
            .collect())
    }
}
