//! Request pipeline: validate, chunk, schedule, collect, assemble.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use embedserve_core::{Chunk, EmbeddingResponse, ErrorKind, PipelineError, PipelineResult, Usage};
use embedserve_embedding::{EmbeddingBackend, ModelLoader};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::assembler::{AggregationPolicy, ChunkResult, ResponseAssembler};
use crate::chunker::Chunker;
use crate::config::{Config, ConfigError};
use crate::executor::InferenceExecutor;
use crate::health::HealthMonitor;
use crate::metrics::PipelineMetrics;
use crate::registry::{ModelHandle, ModelRegistry};
use crate::scheduler::{BatchScheduler, PendingChunk, SchedulerConfig};

/// One embedding request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Documents, addressed by position.
    pub input: Vec<String>,
    /// Model name or alias.
    pub model: String,
    /// Scale every embedding to unit L2 norm.
    #[serde(default)]
    pub normalize: bool,
}

impl EmbeddingRequest {
    #[must_use]
    pub fn new(model: impl Into<String>, input: Vec<String>) -> Self {
        Self {
            input,
            model: model.into(),
            normalize: false,
        }
    }

    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }
}

/// Tunables of [`EmbeddingService`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub scheduler: SchedulerConfig,
    pub workers: usize,
    pub chunker: Chunker,
    pub aggregation: AggregationPolicy,
    pub request_timeout: Duration,
    pub max_inputs_per_request: usize,
}

impl From<&Config> for ServiceOptions {
    fn from(config: &Config) -> Self {
        Self {
            scheduler: SchedulerConfig::from(&config.batching),
            workers: config.batching.worker_count(),
            chunker: Chunker::new(config.chunking.overlap_policy()),
            aggregation: config.chunking.aggregation,
            request_timeout: config.server.request_timeout(),
            max_inputs_per_request: config.server.max_inputs_per_request,
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Scheduler bound to the handle it was built for.
struct ModelLane {
    handle: Arc<ModelHandle>,
    scheduler: Arc<BatchScheduler>,
}

/// Chunking-aware batched embedding service.
///
/// Shared by all request handlers; every model gets one scheduler, created on
/// its first request once the model is `Ready`.
pub struct EmbeddingService {
    options: ServiceOptions,
    registry: Arc<ModelRegistry>,
    metrics: Arc<PipelineMetrics>,
    workers: Arc<Semaphore>,
    lanes: Mutex<HashMap<String, ModelLane>>,
}

impl EmbeddingService {
    /// Creates a service with no models registered.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Internal` if the metrics registry cannot be built.
    pub fn new(options: ServiceOptions) -> PipelineResult<Self> {
        let metrics = Arc::new(
            PipelineMetrics::new()
                .map_err(|e| PipelineError::internal(format!("failed to create metrics: {e}")))?,
        );
        let registry = Arc::new(ModelRegistry::new(metrics.clone()));
        let workers = Arc::new(Semaphore::new(options.workers.max(1)));

        Ok(Self {
            options,
            registry,
            metrics,
            workers,
            lanes: Mutex::new(HashMap::new()),
        })
    }

    /// Creates the service and starts loading every configured model.
    ///
    /// # Errors
    ///
    /// Returns an error if a model's backend cannot be constructed.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let service = Self::new(ServiceOptions::from(config))
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        for model in &config.models {
            service
                .register_model(model.name.clone(), model.aliases.clone(), model.loader()?)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }
        Ok(service)
    }

    /// Registers a model and starts loading it; see [`ModelRegistry::register`].
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Internal` when called outside a Tokio runtime.
    pub fn register_model(
        &self,
        name: impl Into<String>,
        aliases: Vec<String>,
        loader: Arc<dyn ModelLoader>,
    ) -> PipelineResult<Arc<ModelHandle>> {
        let handle = self.registry.register(name, aliases, loader)?;
        self.lanes.lock().remove(handle.name());
        Ok(handle)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn health(&self) -> HealthMonitor {
        HealthMonitor::new(self.registry.clone(), self.metrics.clone())
    }

    #[must_use]
    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Embeds every document of `request`.
    ///
    /// Per-document and per-chunk failures are reported in the response's
    /// `errors` alongside the successes.
    ///
    /// # Errors
    ///
    /// - `Validation` for malformed requests
    /// - `UnknownModel`, `ModelNotReady`, `ModelLoad` for an unusable model
    /// - `Timeout` when results do not arrive within the request timeout
    /// - `NoViableChunks` when no item succeeded
    pub async fn embed(&self, request: EmbeddingRequest) -> PipelineResult<EmbeddingResponse> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("embed", %request_id, model = %request.model);
        self.embed_inner(request_id, request).instrument(span).await
    }

    async fn embed_inner(
        &self,
        request_id: Uuid,
        request: EmbeddingRequest,
    ) -> PipelineResult<EmbeddingResponse> {
        self.validate(&request)?;

        let handle = self.registry.get(&request.model)?;
        let model = handle.name().to_string();
        let backend = match handle.require_ready() {
            Ok(backend) => backend,
            Err(error) => {
                self.metrics.record_error(&model, error.kind());
                return Err(error);
            }
        };
        let scheduler = self.scheduler_for(&handle, backend.clone());

        let started = Instant::now();
        let timeout = self.options.request_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let inputs = request.input.len();
        let mut assembler =
            ResponseAssembler::new(model.clone(), request.normalize, self.options.aggregation);
        let mut usage = Usage::default();

        // tokenization counts against the request deadline
        let documents =
            tokio::time::timeout_at(deadline, self.tokenize_documents(backend, request.input))
                .await
                .map_err(|_| self.timed_out(&model, timeout, "tokenize", inputs))??;

        let (reply, mut results) = mpsc::unbounded_channel();
        let mut rejected = 0;

        for (input_index, document) in documents.into_iter().enumerate() {
            let chunks = match document {
                Ok((prompt_tokens, chunks)) => {
                    usage.prompt_tokens += prompt_tokens;
                    chunks
                }
                Err(error) => {
                    warn!(input_index, error = %error, "Document failed to tokenize");
                    self.metrics.record_error(&model, error.kind());
                    assembler.record_document_error(input_index, &error);
                    continue;
                }
            };

            assembler.expect_chunks(chunks.len());
            usage.chunks += chunks.len();
            for chunk in chunks {
                usage.total_tokens += chunk.token_count();
                let (input_index, chunk_index) = chunk.key();
                if let Err(error) = scheduler.submit(PendingChunk::new(chunk, request_id, reply.clone())) {
                    rejected += 1;
                    self.metrics.record_error(&model, error.kind());
                    assembler.record(ChunkResult {
                        input_index,
                        chunk_index,
                        outcome: Err(error),
                    });
                }
            }
        }
        drop(reply);

        if rejected > 0 {
            warn!(rejected_chunks = rejected, "Batch scheduler rejected chunks");
        }

        let collected = tokio::time::timeout_at(deadline, async {
            while !assembler.is_complete() {
                match results.recv().await {
                    Some(result) => {
                        assembler.record(result);
                    }
                    None => break,
                }
            }
        })
        .await;

        if collected.is_err() {
            // dropping `results` discards whatever is still in flight
            return Err(self.timed_out(&model, timeout, "collect", assembler.pending()));
        }
        if !assembler.is_complete() {
            return Err(PipelineError::internal(format!(
                "{} chunk result(s) lost",
                assembler.pending()
            )));
        }

        match assembler.finish(usage) {
            Ok(response) => {
                let elapsed = started.elapsed();
                self.metrics.record_request(&model, elapsed);
                info!(
                    inputs,
                    chunks = usage.chunks,
                    tokens = usage.total_tokens,
                    failed_items = response.errors.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Embedded request"
                );
                Ok(response)
            }
            Err(error) => {
                self.metrics.record_error(&model, error.kind());
                Err(error)
            }
        }
    }

    fn timed_out(&self, model: &str, timeout: Duration, stage: &'static str, pending: usize) -> PipelineError {
        warn!(
            stage,
            pending,
            timeout_ms = timeout.as_millis() as u64,
            "Request timed out"
        );
        self.metrics.record_error(model, ErrorKind::Timeout);
        PipelineError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn validate(&self, request: &EmbeddingRequest) -> PipelineResult<()> {
        if request.model.trim().is_empty() {
            return Err(PipelineError::Validation("model cannot be empty".to_string()));
        }
        if request.input.is_empty() {
            return Err(PipelineError::Validation("input cannot be empty".to_string()));
        }
        if request.input.len() > self.options.max_inputs_per_request {
            return Err(PipelineError::Validation(format!(
                "{} inputs exceed the maximum of {}",
                request.input.len(),
                self.options.max_inputs_per_request
            )));
        }
        if let Some(index) = request.input.iter().position(|text| text.trim().is_empty()) {
            return Err(PipelineError::Validation(format!(
                "input at index {index} is empty or whitespace"
            )));
        }
        Ok(())
    }

    /// Tokenizes and chunks every document on the blocking pool.
    ///
    /// Outcomes are in input order; a failed document does not affect the others.
    async fn tokenize_documents(
        &self,
        backend: Arc<dyn EmbeddingBackend>,
        inputs: Vec<String>,
    ) -> PipelineResult<Vec<PipelineResult<(usize, Vec<Chunk>)>>> {
        let chunker = self.options.chunker;
        tokio::task::spawn_blocking(move || {
            let max = backend.max_sequence_length();
            inputs
                .iter()
                .enumerate()
                .map(|(input_index, text)| {
                    tokenize_document(backend.as_ref(), &chunker, input_index, text, max)
                })
                .collect()
        })
        .await
        .map_err(|e| PipelineError::internal(format!("tokenization task failed: {e}")))
    }

    /// Scheduler of a `Ready` handle, created on first use.
    fn scheduler_for(
        &self,
        handle: &Arc<ModelHandle>,
        backend: Arc<dyn EmbeddingBackend>,
    ) -> Arc<BatchScheduler> {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get(handle.name()) {
            if Arc::ptr_eq(&lane.handle, handle) {
                return lane.scheduler.clone();
            }
        }

        let executor = Arc::new(InferenceExecutor::new(
            handle.name(),
            backend,
            self.metrics.clone(),
        ));
        let scheduler = Arc::new(BatchScheduler::spawn(
            executor,
            self.options.scheduler,
            self.workers.clone(),
            self.metrics.clone(),
        ));
        lanes.insert(
            handle.name().to_string(),
            ModelLane {
                handle: handle.clone(),
                scheduler: scheduler.clone(),
            },
        );
        scheduler
    }
}

/// Token count and chunks of one document.
fn tokenize_document(
    backend: &dyn EmbeddingBackend,
    chunker: &Chunker,
    input_index: usize,
    text: &str,
    max: usize,
) -> PipelineResult<(usize, Vec<Chunk>)> {
    let token_ids = backend
        .tokenize(text)
        .map_err(|e| PipelineError::tokenization(e.to_string()))?;
    let chunks = chunker.chunk(input_index, &token_ids, max)?;
    Ok((token_ids.len(), chunks))
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedserve_embedding::{MockBackend, MockLoader};

    async fn service() -> EmbeddingService {
        let service = EmbeddingService::new(ServiceOptions::default()).unwrap();
        let handle = service
            .register_model(
                MockBackend::DEFAULT_MODEL,
                vec![],
                Arc::new(MockLoader::new(MockBackend::new())),
            )
            .unwrap();
        handle.wait_settled().await;
        service
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let service = service().await;
        let model = MockBackend::DEFAULT_MODEL;

        for request in [
            EmbeddingRequest::new(model, vec![]),
            EmbeddingRequest::new(model, vec!["ok".to_string(), "   ".to_string()]),
            EmbeddingRequest::new("", vec!["ok".to_string()]),
        ] {
            assert!(matches!(
                service.embed(request).await,
                Err(PipelineError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_usage_accounting() {
        let service = service().await;
        let request = EmbeddingRequest::new(
            "all-MiniLM-L6-v2",
            vec!["one two three".to_string(), "four five".to_string()],
        );

        let response = service.embed(request).await.unwrap();
        assert_eq!(response.model, MockBackend::DEFAULT_MODEL);
        assert_eq!(response.data.len(), 2);
        assert_eq!(response.usage.prompt_tokens, 5);
        assert_eq!(response.usage.total_tokens, 5);
        assert_eq!(response.usage.chunks, 2);
    }

    #[tokio::test]
    async fn test_scheduler_reused_per_handle() {
        let service = service().await;
        let handle = service.registry().get(MockBackend::DEFAULT_MODEL).unwrap();
        let backend = handle.backend().unwrap();

        let a = service.scheduler_for(&handle, backend.clone());
        let b = service.scheduler_for(&handle, backend);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_rejected_chunks_counted_by_their_kind() {
        let request = EmbeddingRequest::new(MockBackend::DEFAULT_MODEL, vec!["one two".to_string()]);

        let first = tokio::runtime::Runtime::new().unwrap();
        let service = first.block_on(service());
        first.block_on(service.embed(request.clone())).unwrap();
        // the scheduler's consumer task dies with its runtime
        drop(first);

        let second = tokio::runtime::Runtime::new().unwrap();
        match second.block_on(service.embed(request)) {
            Err(PipelineError::NoViableChunks { errors }) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].kind, ErrorKind::Internal);
            }
            other => panic!("expected NoViableChunks, got {other:?}"),
        }

        let metrics = service.metrics();
        assert_eq!(metrics.error_count(MockBackend::DEFAULT_MODEL, ErrorKind::Internal), 1);
        assert_eq!(metrics.error_count(MockBackend::DEFAULT_MODEL, ErrorKind::Overloaded), 0);
    }
}
