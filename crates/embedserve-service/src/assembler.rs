//! Per-request reassembly of chunk results.

use std::collections::BTreeMap;

use embedserve_core::{EmbeddingResponse, ItemError, PipelineError, PipelineResult, ResponseItem, Usage};
use serde::{Deserialize, Serialize};

/// How chunk vectors of one document are turned into response items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPolicy {
    /// One item per chunk.
    #[default]
    None,
    /// One item per document: the mean of its chunk vectors, at `chunk_index` 0.
    Mean,
}

impl AggregationPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mean => "mean",
        }
    }
}

/// Outcome of one chunk, delivered to the request's collector.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub input_index: usize,
    pub chunk_index: usize,
    pub outcome: Result<Vec<f32>, PipelineError>,
}

impl ChunkResult {
    #[must_use]
    pub const fn key(&self) -> (usize, usize) {
        (self.input_index, self.chunk_index)
    }
}

/// Scales `vector` to unit L2 norm in place.
///
/// Returns `false` and leaves the vector untouched when its norm is zero.
pub fn l2_normalize(vector: &mut [f32]) -> bool {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
    true
}

/// Element-wise mean of equally sized vectors.
#[must_use]
pub fn mean_pool(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut pooled = vec![0.0f32; first.len()];
    for vector in vectors {
        for (acc, value) in pooled.iter_mut().zip(vector.iter()) {
            *acc += value;
        }
    }
    let count = vectors.len() as f32;
    for value in &mut pooled {
        *value /= count;
    }
    pooled
}

/// Collects results keyed by `(input_index, chunk_index)` for one request.
///
/// Results may arrive in any order; the first result for a key wins.
#[derive(Debug)]
pub struct ResponseAssembler {
    model: String,
    normalize: bool,
    aggregation: AggregationPolicy,
    expected: usize,
    results: BTreeMap<(usize, usize), Result<Vec<f32>, PipelineError>>,
    document_errors: Vec<ItemError>,
}

impl ResponseAssembler {
    #[must_use]
    pub fn new(model: impl Into<String>, normalize: bool, aggregation: AggregationPolicy) -> Self {
        Self {
            model: model.into(),
            normalize,
            aggregation,
            expected: 0,
            results: BTreeMap::new(),
            document_errors: Vec::new(),
        }
    }

    /// Registers `count` more chunks the request is waiting for.
    pub fn expect_chunks(&mut self, count: usize) {
        self.expected += count;
    }

    /// Records a document-scoped failure (no chunks were produced).
    pub fn record_document_error(&mut self, index: usize, error: &PipelineError) {
        self.document_errors.push(ItemError {
            index,
            chunk_index: None,
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// Stores a chunk result. Returns `true` once every expected chunk is in.
    pub fn record(&mut self, result: ChunkResult) -> bool {
        self.results.entry(result.key()).or_insert(result.outcome);
        self.is_complete()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.results.len() >= self.expected
    }

    /// Chunks still outstanding.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.expected.saturating_sub(self.results.len())
    }

    /// Builds the ordered response.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NoViableChunks` when no item succeeded.
    pub fn finish(self, usage: Usage) -> PipelineResult<EmbeddingResponse> {
        let mut errors = self.document_errors;
        let mut data = Vec::with_capacity(self.results.len());

        match self.aggregation {
            AggregationPolicy::None => {
                for ((index, chunk_index), outcome) in self.results {
                    match outcome {
                        Ok(embedding) => data.push(ResponseItem::new(index, chunk_index, embedding)),
                        Err(error) => errors.push(chunk_error(index, chunk_index, &error)),
                    }
                }
            }
            AggregationPolicy::Mean => {
                let mut documents: BTreeMap<usize, Vec<(usize, Result<Vec<f32>, PipelineError>)>> =
                    BTreeMap::new();
                for ((index, chunk_index), outcome) in self.results {
                    documents.entry(index).or_default().push((chunk_index, outcome));
                }
                for (index, chunks) in documents {
                    let failed: Vec<ItemError> = chunks
                        .iter()
                        .filter_map(|(chunk_index, outcome)| {
                            outcome.as_ref().err().map(|e| chunk_error(index, *chunk_index, e))
                        })
                        .collect();
                    if failed.is_empty() {
                        let vectors: Vec<&[f32]> = chunks
                            .iter()
                            .filter_map(|(_, outcome)| outcome.as_ref().ok().map(Vec::as_slice))
                            .collect();
                        data.push(ResponseItem::new(index, 0, mean_pool(&vectors)));
                    } else {
                        errors.extend(failed);
                    }
                }
            }
        }

        errors.sort_by_key(|e| (e.index, e.chunk_index));

        if data.is_empty() {
            return Err(PipelineError::NoViableChunks { errors });
        }

        if self.normalize {
            for item in &mut data {
                item.zero_norm = !l2_normalize(&mut item.embedding);
            }
        }

        let mut response = EmbeddingResponse::new(self.model, data, usage);
        response.errors = errors;
        Ok(response)
    }
}

fn chunk_error(index: usize, chunk_index: usize, error: &PipelineError) -> ItemError {
    ItemError {
        index,
        chunk_index: Some(chunk_index),
        kind: error.kind(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedserve_core::ErrorKind;

    fn ok(input_index: usize, chunk_index: usize, embedding: Vec<f32>) -> ChunkResult {
        ChunkResult {
            input_index,
            chunk_index,
            outcome: Ok(embedding),
        }
    }

    #[test]
    fn test_out_of_order_results_sorted() {
        let mut assembler = ResponseAssembler::new("m", false, AggregationPolicy::None);
        assembler.expect_chunks(4);
        assert!(!assembler.record(ok(1, 0, vec![3.0])));
        assert!(!assembler.record(ok(0, 1, vec![2.0])));
        assert!(!assembler.record(ok(1, 1, vec![4.0])));
        assert_eq!(assembler.pending(), 1);
        assert!(assembler.record(ok(0, 0, vec![1.0])));

        let response = assembler.finish(Usage::default()).unwrap();
        let keys: Vec<_> = response.data.iter().map(|i| (i.index, i.chunk_index)).collect();
        assert_eq!(keys, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(response.data[3].embedding, vec![4.0]);
    }

    #[test]
    fn test_normalize_and_zero_vector() {
        let mut assembler = ResponseAssembler::new("m", true, AggregationPolicy::None);
        assembler.expect_chunks(2);
        assembler.record(ok(0, 0, vec![3.0, 4.0]));
        assembler.record(ok(1, 0, vec![0.0, 0.0]));

        let response = assembler.finish(Usage::default()).unwrap();
        let norm: f32 = response.data[0].embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!(!response.data[0].zero_norm);
        assert_eq!(response.data[1].embedding, vec![0.0, 0.0]);
        assert!(response.data[1].zero_norm);
    }

    #[test]
    fn test_partial_failure_keeps_successes() {
        let mut assembler = ResponseAssembler::new("m", false, AggregationPolicy::None);
        assembler.record_document_error(2, &PipelineError::tokenization("bad bytes"));
        assembler.expect_chunks(2);
        assembler.record(ok(0, 0, vec![1.0]));
        assembler.record(ChunkResult {
            input_index: 1,
            chunk_index: 0,
            outcome: Err(PipelineError::inference("oom")),
        });

        let response = assembler.finish(Usage::default()).unwrap();
        assert_eq!(response.data.len(), 1);
        assert!(response.is_partial());
        assert_eq!(response.errors[0].index, 1);
        assert_eq!(response.errors[0].kind, ErrorKind::Inference);
        assert_eq!(response.errors[1].index, 2);
        assert_eq!(response.errors[1].chunk_index, None);
    }

    #[test]
    fn test_all_failed_is_no_viable_chunks() {
        let mut assembler = ResponseAssembler::new("m", false, AggregationPolicy::None);
        assembler.expect_chunks(1);
        assembler.record(ChunkResult {
            input_index: 0,
            chunk_index: 0,
            outcome: Err(PipelineError::inference("oom")),
        });

        match assembler.finish(Usage::default()) {
            Err(PipelineError::NoViableChunks { errors }) => assert_eq!(errors.len(), 1),
            other => panic!("expected NoViableChunks, got {other:?}"),
        }
    }

    #[test]
    fn test_mean_aggregation() {
        let mut assembler = ResponseAssembler::new("m", false, AggregationPolicy::Mean);
        assembler.expect_chunks(3);
        assembler.record(ok(0, 0, vec![1.0, 3.0]));
        assembler.record(ok(0, 1, vec![3.0, 5.0]));
        assembler.record(ok(1, 0, vec![2.0, 2.0]));

        let response = assembler.finish(Usage::default()).unwrap();
        assert_eq!(response.data.len(), 2);
        assert_eq!(response.data[0].embedding, vec![2.0, 4.0]);
        assert_eq!(response.data[0].chunk_index, 0);
        assert_eq!(response.data[1].index, 1);
    }

    #[test]
    fn test_duplicate_result_ignored() {
        let mut assembler = ResponseAssembler::new("m", false, AggregationPolicy::None);
        assembler.expect_chunks(1);
        assembler.record(ok(0, 0, vec![1.0]));
        assembler.record(ok(0, 0, vec![9.0]));
        let response = assembler.finish(Usage::default()).unwrap();
        assert_eq!(response.data[0].embedding, vec![1.0]);
    }
}
