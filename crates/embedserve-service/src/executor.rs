//! Inference executor: one forward pass per batch, bisection on failure.

use std::sync::Arc;
use std::time::Instant;

use embedserve_core::{ErrorKind, PipelineError, PipelineResult};
use embedserve_embedding::{EmbeddingBackend, ForwardBatch};
use tracing::{debug, warn};

use crate::assembler::ChunkResult;
use crate::metrics::PipelineMetrics;
use crate::scheduler::PendingChunk;

/// Runs batches against one model's backend and routes results to requests.
pub struct InferenceExecutor {
    model: String,
    backend: Arc<dyn EmbeddingBackend>,
    metrics: Arc<PipelineMetrics>,
}

impl InferenceExecutor {
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        backend: Arc<dyn EmbeddingBackend>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            model: model.into(),
            backend,
            metrics,
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embeds `batch`, one outcome per sequence in order.
    ///
    /// Calls `forward` once. If that fails for a batch of more than one
    /// sequence, each half is retried once; a half that fails again reports
    /// its error on every one of its sequences.
    #[must_use]
    pub fn infer(&self, batch: ForwardBatch) -> Vec<PipelineResult<Vec<f32>>> {
        let batch = if self.backend.requires_fixed_shape() {
            batch.padded(self.backend.pad_token_id())
        } else {
            batch
        };

        let error = match self.forward(&batch) {
            Ok(vectors) => return vectors.into_iter().map(Ok).collect(),
            Err(error) => error,
        };

        if batch.len() <= 1 {
            return vec![Err(error)];
        }

        warn!(
            model = %self.model,
            batch_size = batch.len(),
            error = %error,
            "Forward pass failed, retrying bisected batch"
        );

        let mid = batch.len() / 2;
        let (head, tail) = batch.split_at(mid);
        [head, tail]
            .into_iter()
            .flat_map(|half| match self.forward(&half) {
                Ok(vectors) => vectors.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(error) => vec![Err(error); half.len()],
            })
            .collect()
    }

    fn forward(&self, batch: &ForwardBatch) -> PipelineResult<Vec<Vec<f32>>> {
        let vectors = self
            .backend
            .forward(batch)
            .map_err(|e| PipelineError::inference(e.to_string()))?;

        if vectors.len() != batch.len() {
            return Err(PipelineError::inference(format!(
                "backend returned {} vectors for {} sequences",
                vectors.len(),
                batch.len()
            )));
        }
        let dimension = self.backend.embedding_dim();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(PipelineError::inference(format!(
                "backend returned a vector of dimension {}, expected {}",
                bad.len(),
                dimension
            )));
        }
        Ok(vectors)
    }

    /// Runs `chunks` on the blocking pool and sends each result to its request.
    ///
    /// A request that already gave up has dropped its receiver; its results
    /// are discarded.
    pub async fn execute(self: Arc<Self>, chunks: Vec<PendingChunk>) {
        let started = Instant::now();
        let size = chunks.len();
        let tokens: usize = chunks.iter().map(|p| p.chunk.token_count()).sum();
        let batch = ForwardBatch::new(chunks.iter().map(|p| p.chunk.token_ids.clone()).collect());

        let executor = self.clone();
        let outcomes = match tokio::task::spawn_blocking(move || executor.infer(batch)).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                let error = PipelineError::internal(format!("inference task failed: {e}"));
                vec![Err(error); size]
            }
        };

        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        self.metrics.record_batch(&self.model, size);
        self.metrics.record_chunks(&self.model, succeeded);
        self.metrics
            .record_errors(&self.model, ErrorKind::Inference, size - succeeded);

        debug!(
            model = %self.model,
            batch_size = size,
            tokens,
            failed = size - succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Executed batch"
        );

        for (pending, outcome) in chunks.into_iter().zip(outcomes) {
            let result = ChunkResult {
                input_index: pending.chunk.input_index,
                chunk_index: pending.chunk.chunk_index,
                outcome,
            };
            if pending.reply.send(result).is_err() {
                debug!(
                    model = %self.model,
                    request_id = %pending.request_id,
                    "Request gone, discarding chunk result"
                );
            }
        }
    }
}

impl std::fmt::Debug for InferenceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceExecutor")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedserve_embedding::MockBackend;

    fn executor(backend: Arc<MockBackend>) -> InferenceExecutor {
        InferenceExecutor::new("mock", backend, Arc::new(PipelineMetrics::new().unwrap()))
    }

    fn tokens(backend: &MockBackend, text: &str) -> Vec<u32> {
        backend.tokenize(text).unwrap()
    }

    #[test]
    fn test_single_forward_per_batch() {
        let backend = Arc::new(MockBackend::with_model("mock", 8, 16));
        let executor = executor(backend.clone());
        let batch = ForwardBatch::new(vec![tokens(&backend, "a b"), tokens(&backend, "c")]);

        let outcomes = executor.infer(batch);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(backend.forward_calls(), 1);
    }

    #[test]
    fn test_fixed_shape_backend_gets_padded_batch() {
        let backend = Arc::new(MockBackend::with_model("mock", 8, 16).with_fixed_shape());
        let executor = executor(backend.clone());
        let batch = ForwardBatch::new(vec![tokens(&backend, "a b c"), tokens(&backend, "d")]);

        let outcomes = executor.infer(batch);
        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(backend.forward_calls(), 1);
    }

    #[test]
    fn test_bisection_isolates_failing_half() {
        let backend = Arc::new(MockBackend::with_model("mock", 8, 16).with_poison_word("boom"));
        let executor = executor(backend.clone());
        let batch = ForwardBatch::new(vec![
            tokens(&backend, "fine one"),
            tokens(&backend, "fine two"),
            tokens(&backend, "boom"),
            tokens(&backend, "fine three"),
        ]);

        let outcomes = executor.infer(batch);
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_ok());
        assert!(matches!(outcomes[2], Err(PipelineError::Inference { .. })));
        assert!(matches!(outcomes[3], Err(PipelineError::Inference { .. })));
        // original + two halves
        assert_eq!(backend.forward_calls(), 3);
    }

    #[test]
    fn test_bisection_recovers_capacity_failure() {
        let backend = Arc::new(MockBackend::with_model("mock", 8, 16).with_max_forward_batch(2));
        let executor = executor(backend.clone());
        let batch = ForwardBatch::new((0..4).map(|i| vec![i + 1]).collect());

        let outcomes = executor.infer(batch);
        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(backend.forward_calls(), 3);
    }

    #[test]
    fn test_single_chunk_failure_not_retried() {
        let backend = Arc::new(MockBackend::with_model("mock", 8, 16).with_poison_word("boom"));
        let executor = executor(backend.clone());
        let outcomes = executor.infer(ForwardBatch::new(vec![tokens(&backend, "boom")]));
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_err());
        assert_eq!(backend.forward_calls(), 1);
    }
}
