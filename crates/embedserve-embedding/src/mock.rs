use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::provider::{EmbeddingBackend, ModelLoader};
use crate::types::{EmbeddingError, EmbeddingResult, ForwardBatch};

/// Mock embedding backend for testing and development.
///
/// Tokenizes on whitespace, hashing each word to a stable id, and generates
/// deterministic vectors from the token sequence so that integration tests run
/// without ML dependencies. Failures can be injected per token.
pub struct MockBackend {
    model: String,
    dimension: usize,
    max_sequence_length: usize,
    latency: Duration,
    tokenize_latency: Duration,
    fixed_shape: bool,
    poison_token: Option<u32>,
    zero_token: Option<u32>,
    max_forward_batch: Option<usize>,
    forward_calls: AtomicUsize,
    largest_batch: AtomicUsize,
}

impl MockBackend {
    /// Default model name for the mock backend.
    pub const DEFAULT_MODEL: &'static str = "sentence-transformers/all-MiniLM-L6-v2";
    /// Default dimension (384).
    pub const DEFAULT_DIMENSION: usize = 384;
    /// Default maximum sequence length (256).
    pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 256;
    /// Size of the hashed vocabulary; id 0 is reserved for padding.
    pub const VOCAB_SIZE: u32 = 30_522;

    /// Creates a mock backend with default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::with_model(
            Self::DEFAULT_MODEL,
            Self::DEFAULT_DIMENSION,
            Self::DEFAULT_MAX_SEQUENCE_LENGTH,
        )
    }

    /// Creates a mock backend with custom name and limits.
    #[must_use]
    pub fn with_model(model: impl Into<String>, dimension: usize, max_sequence_length: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
            max_sequence_length,
            latency: Duration::ZERO,
            tokenize_latency: Duration::ZERO,
            fixed_shape: false,
            poison_token: None,
            zero_token: None,
            max_forward_batch: None,
            forward_calls: AtomicUsize::new(0),
            largest_batch: AtomicUsize::new(0),
        }
    }

    /// Sets the simulated latency of every forward pass.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets the simulated latency of every `tokenize` call.
    #[must_use]
    pub fn with_tokenize_latency(mut self, latency: Duration) -> Self {
        self.tokenize_latency = latency;
        self
    }

    /// Requires rectangular (padded) batches, like a static-shape graph.
    #[must_use]
    pub fn with_fixed_shape(mut self) -> Self {
        self.fixed_shape = true;
        self
    }

    /// Any batch containing `word` fails with `ResourceExhausted`.
    #[must_use]
    pub fn with_poison_word(mut self, word: &str) -> Self {
        self.poison_token = Some(Self::token_id(word));
        self
    }

    /// Sequences made only of `word` embed to the zero vector.
    #[must_use]
    pub fn with_zero_word(mut self, word: &str) -> Self {
        self.zero_token = Some(Self::token_id(word));
        self
    }

    /// Batches larger than `max` fail with `ResourceExhausted`.
    #[must_use]
    pub fn with_max_forward_batch(mut self, max: usize) -> Self {
        self.max_forward_batch = Some(max);
        self
    }

    /// Stable token id of a word.
    #[must_use]
    pub fn token_id(word: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        (hasher.finish() % u64::from(Self::VOCAB_SIZE - 1)) as u32 + 1
    }

    /// Number of `forward` calls so far.
    #[must_use]
    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    /// Largest batch seen by `forward`.
    #[must_use]
    pub fn largest_batch(&self) -> usize {
        self.largest_batch.load(Ordering::SeqCst)
    }

    /// Deterministic vector for a token sequence.
    fn generate_embedding(&self, tokens: &[u32]) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        tokens.hash(&mut hasher);
        let mut state = hasher.finish();

        (0..self.dimension)
            .map(|i| {
                // Simple LCG for deterministic values
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
                let value = ((state >> 33) as f32) / ((1u64 << 30) as f32) - 1.0; // Range: [-1, 1)
                let position_factor = (i as f32 / self.dimension as f32) * 0.1;
                value * (1.0 + position_factor)
            })
            .collect()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingBackend for MockBackend {
    fn name(&self) -> &str {
        &self.model
    }

    fn tokenize(&self, text: &str) -> EmbeddingResult<Vec<u32>> {
        if !self.tokenize_latency.is_zero() {
            std::thread::sleep(self.tokenize_latency);
        }
        if text.contains(char::REPLACEMENT_CHARACTER) {
            return Err(EmbeddingError::Tokenization(
                "input contains undecodable bytes".to_string(),
            ));
        }
        Ok(text.split_whitespace().map(Self::token_id).collect())
    }

    fn forward(&self, batch: &ForwardBatch) -> EmbeddingResult<Vec<Vec<f32>>> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        self.largest_batch.fetch_max(batch.len(), Ordering::SeqCst);

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        if batch.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty batch".to_string()));
        }

        if self.fixed_shape && !batch.is_rectangular() {
            return Err(EmbeddingError::InvalidInput(
                "batch is not padded to a common width".to_string(),
            ));
        }

        if let Some(max) = self.max_forward_batch {
            if batch.len() > max {
                return Err(EmbeddingError::ResourceExhausted(format!(
                    "batch of {} exceeds device capacity of {}",
                    batch.len(),
                    max
                )));
            }
        }

        (0..batch.len())
            .map(|i| {
                let tokens = batch.tokens(i);
                if tokens.len() > self.max_sequence_length {
                    return Err(EmbeddingError::InvalidInput(format!(
                        "sequence of {} tokens exceeds maximum of {}",
                        tokens.len(),
                        self.max_sequence_length
                    )));
                }
                if let Some(poison) = self.poison_token {
                    if tokens.contains(&poison) {
                        return Err(EmbeddingError::ResourceExhausted(
                            "poisoned sequence in batch".to_string(),
                        ));
                    }
                }
                if let Some(zero) = self.zero_token {
                    if !tokens.is_empty() && tokens.iter().all(|&t| t == zero) {
                        return Ok(vec![0.0; self.dimension]);
                    }
                }
                Ok(self.generate_embedding(tokens))
            })
            .collect()
    }

    fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    fn embedding_dim(&self) -> usize {
        self.dimension
    }

    fn requires_fixed_shape(&self) -> bool {
        self.fixed_shape
    }
}

/// Loader handing out a prebuilt [`MockBackend`].
///
/// Loading can be delayed, held behind a gate, or made to fail.
pub struct MockLoader {
    backend: Arc<MockBackend>,
    delay: Duration,
    gate: Option<Arc<Notify>>,
    failure: Option<String>,
}

impl MockLoader {
    #[must_use]
    pub fn new(backend: MockBackend) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    /// Shares `backend` so callers can inspect it after loading.
    #[must_use]
    pub fn from_arc(backend: Arc<MockBackend>) -> Self {
        Self {
            backend,
            delay: Duration::ZERO,
            gate: None,
            failure: None,
        }
    }

    /// A loader whose `load` always fails with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(MockBackend::new())
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Blocks loading until `gate` is notified.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl ModelLoader for MockLoader {
    async fn load(&self) -> EmbeddingResult<Arc<dyn EmbeddingBackend>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.failure {
            tracing::warn!(model = %self.backend.model, error = %message, "Mock model load failed");
            return Err(EmbeddingError::ModelNotFound(message.clone()));
        }
        tracing::debug!(
            model = %self.backend.model,
            dimension = self.backend.dimension,
            max_sequence_length = self.backend.max_sequence_length,
            "Loaded mock backend"
        );
        Ok(self.backend.clone())
    }
}
