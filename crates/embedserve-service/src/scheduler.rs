//! Per-model batch scheduler.
//!
//! All requests for a model feed one pending queue drained by a single
//! consumer task. The consumer packs chunks into batches and flushes when any
//! bound is hit:
//! - `max_batch_chunks` chunks are pending
//! - pending chunks hold `max_batch_tokens` tokens
//! - the oldest pending chunk has waited `max_batch_wait`
//!
//! Flushed batches are handed to the executor once a worker permit is free.
//! While all workers are busy the queue keeps growing; past
//! `max_queue_depth` new chunks are rejected with `Overloaded`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use embedserve_core::{Chunk, PipelineError, PipelineResult};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::assembler::ChunkResult;
use crate::config::BatchingConfig;
use crate::executor::InferenceExecutor;
use crate::metrics::PipelineMetrics;

/// Scheduler bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_batch_chunks: usize,
    pub max_batch_tokens: usize,
    pub max_batch_wait: Duration,
    pub max_queue_depth: usize,
}

impl From<&BatchingConfig> for SchedulerConfig {
    fn from(config: &BatchingConfig) -> Self {
        Self {
            max_batch_chunks: config.max_batch_chunks,
            max_batch_tokens: config.max_batch_tokens,
            max_batch_wait: config.max_batch_wait(),
            max_queue_depth: config.max_queue_depth,
        }
    }
}

/// A queued chunk with its routing information.
#[derive(Debug)]
pub struct PendingChunk {
    pub chunk: Chunk,
    pub request_id: Uuid,
    pub reply: mpsc::UnboundedSender<ChunkResult>,
    pub enqueued_at: Instant,
}

impl PendingChunk {
    #[must_use]
    pub fn new(chunk: Chunk, request_id: Uuid, reply: mpsc::UnboundedSender<ChunkResult>) -> Self {
        Self {
            chunk,
            request_id,
            reply,
            enqueued_at: Instant::now(),
        }
    }
}

/// Submission side of one model's pending queue.
pub struct BatchScheduler {
    model: String,
    config: SchedulerConfig,
    sender: mpsc::UnboundedSender<PendingChunk>,
    depth: Arc<AtomicUsize>,
    metrics: Arc<PipelineMetrics>,
}

impl BatchScheduler {
    /// Spawns the consumer loop on the current runtime.
    ///
    /// `workers` bounds how many batches run at once; it may be shared with
    /// other schedulers.
    #[must_use]
    pub fn spawn(
        executor: Arc<InferenceExecutor>,
        config: SchedulerConfig,
        workers: Arc<Semaphore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let model = executor.model().to_string();

        let consumer = Consumer {
            model: model.clone(),
            config,
            receiver,
            depth: depth.clone(),
            workers,
            executor,
            metrics: metrics.clone(),
            pending: Vec::new(),
            pending_tokens: 0,
        };
        tokio::spawn(consumer.run());

        info!(
            model = %model,
            max_batch_chunks = config.max_batch_chunks,
            max_batch_tokens = config.max_batch_tokens,
            max_batch_wait_ms = config.max_batch_wait.as_millis() as u64,
            max_queue_depth = config.max_queue_depth,
            "Batch scheduler started"
        );

        Self {
            model,
            config,
            sender,
            depth,
            metrics,
        }
    }

    /// Enqueues one chunk.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Overloaded` when `max_queue_depth` chunks are
    /// already pending; the chunk is not queued.
    pub fn submit(&self, pending: PendingChunk) -> PipelineResult<()> {
        let max = self.config.max_queue_depth;
        let admitted = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < max).then_some(depth + 1)
            });

        match admitted {
            Ok(previous) => {
                self.metrics.set_queue_depth(&self.model, previous + 1);
                self.sender.send(pending).map_err(|_| {
                    self.depth.fetch_sub(1, Ordering::AcqRel);
                    PipelineError::internal(format!("scheduler for `{}` has stopped", self.model))
                })
            }
            Err(_) => Err(PipelineError::Overloaded {
                model: self.model.clone(),
                depth: max,
            }),
        }
    }

    /// Chunks queued but not yet dispatched.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("model", &self.model)
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

/// Single consumer of a model's pending queue.
struct Consumer {
    model: String,
    config: SchedulerConfig,
    receiver: mpsc::UnboundedReceiver<PendingChunk>,
    depth: Arc<AtomicUsize>,
    workers: Arc<Semaphore>,
    executor: Arc<InferenceExecutor>,
    metrics: Arc<PipelineMetrics>,
    pending: Vec<PendingChunk>,
    pending_tokens: usize,
}

impl Consumer {
    async fn run(mut self) {
        loop {
            let deadline = self
                .pending
                .first()
                .map(|oldest| oldest.enqueued_at + self.config.max_batch_wait);

            let received = match deadline {
                Some(deadline) => tokio::select! {
                    next = self.receiver.recv() => Some(next),
                    () = tokio::time::sleep_until(deadline) => None,
                },
                None => Some(self.receiver.recv().await),
            };

            let Some(next) = received else {
                self.flush("max_wait").await;
                continue;
            };

            let Some(pending) = next else {
                self.flush("shutdown").await;
                debug!(model = %self.model, "Batch scheduler stopped");
                return;
            };

            let tokens = pending.chunk.token_count();
            if !self.pending.is_empty() && self.pending_tokens + tokens > self.config.max_batch_tokens {
                self.flush("max_tokens").await;
            }

            self.pending_tokens += tokens;
            self.pending.push(pending);

            if self.pending.len() >= self.config.max_batch_chunks {
                self.flush("max_chunks").await;
            } else if self.pending_tokens >= self.config.max_batch_tokens {
                self.flush("max_tokens").await;
            } else if self
                .pending
                .first()
                .is_some_and(|oldest| oldest.enqueued_at.elapsed() >= self.config.max_batch_wait)
            {
                self.flush("max_wait").await;
            }
        }
    }

    async fn flush(&mut self, reason: &'static str) {
        if self.pending.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.pending);
        let tokens = std::mem::take(&mut self.pending_tokens);

        let Ok(permit) = self.workers.clone().acquire_owned().await else {
            // Semaphore closed: no workers will ever run this batch.
            self.release(batch.len());
            for pending in batch {
                let _ = pending.reply.send(ChunkResult {
                    input_index: pending.chunk.input_index,
                    chunk_index: pending.chunk.chunk_index,
                    outcome: Err(PipelineError::internal("worker pool closed")),
                });
            }
            return;
        };

        self.release(batch.len());

        debug!(
            model = %self.model,
            batch_size = batch.len(),
            tokens,
            reason,
            "Flushed batch"
        );

        let executor = self.executor.clone();
        tokio::spawn(async move {
            let _permit = permit;
            executor.execute(batch).await;
        });
    }

    fn release(&self, count: usize) {
        let depth = self.depth.fetch_sub(count, Ordering::AcqRel) - count;
        self.metrics.set_queue_depth(&self.model, depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedserve_embedding::MockBackend;

    fn chunk(input_index: usize, tokens: usize) -> Chunk {
        Chunk {
            input_index,
            chunk_index: 0,
            span: embedserve_core::TokenSpan::new(0, tokens),
            token_ids: vec![7; tokens],
        }
    }

    fn scheduler(
        backend: Arc<MockBackend>,
        config: SchedulerConfig,
        workers: usize,
    ) -> BatchScheduler {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let executor = Arc::new(InferenceExecutor::new("mock", backend, metrics.clone()));
        BatchScheduler::spawn(executor, config, Arc::new(Semaphore::new(workers)), metrics)
    }

    fn config(chunks: usize, tokens: usize, wait_ms: u64, depth: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_batch_chunks: chunks,
            max_batch_tokens: tokens,
            max_batch_wait: Duration::from_millis(wait_ms),
            max_queue_depth: depth,
        }
    }

    async fn collect(
        receiver: &mut mpsc::UnboundedReceiver<ChunkResult>,
        count: usize,
    ) -> Vec<ChunkResult> {
        let mut results = Vec::new();
        while results.len() < count {
            results.push(receiver.recv().await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_flush_on_chunk_count() {
        let backend = Arc::new(MockBackend::with_model("mock", 4, 64));
        // long wait: only the count bound can flush
        let scheduler = scheduler(backend.clone(), config(4, 10_000, 60_000, 100), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        for i in 0..4 {
            scheduler.submit(PendingChunk::new(chunk(i, 3), id, tx.clone())).unwrap();
        }
        let results = collect(&mut rx, 4).await;
        assert!(results.iter().all(|r| r.outcome.is_ok()));
        assert_eq!(backend.forward_calls(), 1);
        assert_eq!(backend.largest_batch(), 4);
    }

    #[tokio::test]
    async fn test_flush_on_token_bound() {
        let backend = Arc::new(MockBackend::with_model("mock", 4, 64));
        let scheduler = scheduler(backend.clone(), config(100, 10, 60_000, 100), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        // 6 + 6 exceeds 10: first chunk flushes alone before the second is added
        scheduler.submit(PendingChunk::new(chunk(0, 6), id, tx.clone())).unwrap();
        scheduler.submit(PendingChunk::new(chunk(1, 6), id, tx.clone())).unwrap();
        scheduler.submit(PendingChunk::new(chunk(2, 4), id, tx.clone())).unwrap();

        collect(&mut rx, 3).await;
        assert_eq!(backend.forward_calls(), 2);
        assert_eq!(backend.largest_batch(), 2);
    }

    #[tokio::test]
    async fn test_flush_on_max_wait() {
        let backend = Arc::new(MockBackend::with_model("mock", 4, 64));
        let scheduler = scheduler(backend.clone(), config(100, 10_000, 10, 100), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        scheduler
            .submit(PendingChunk::new(chunk(0, 3), Uuid::new_v4(), tx))
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(result.outcome.is_ok());
        assert_eq!(backend.forward_calls(), 1);
    }

    #[tokio::test]
    async fn test_overloaded_when_queue_full() {
        let backend = Arc::new(MockBackend::with_model("mock", 4, 64).with_latency(Duration::from_millis(200)));
        // one chunk per batch, one worker: the loop blocks on the permit
        let scheduler = scheduler(backend.clone(), config(1, 10_000, 60_000, 2), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut accepted = 0;
        let mut rejected = 0;
        for i in 0..10 {
            match scheduler.submit(PendingChunk::new(chunk(i, 2), id, tx.clone())) {
                Ok(()) => accepted += 1,
                Err(PipelineError::Overloaded { depth, .. }) => {
                    assert_eq!(depth, 2);
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(accepted, 2);
        assert_eq!(rejected, 8);

        // already-queued chunks complete
        let results = collect(&mut rx, accepted).await;
        assert!(results.iter().all(|r| r.outcome.is_ok()));
    }
}
