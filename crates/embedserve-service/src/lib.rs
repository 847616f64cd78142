//! Service layer for embedserve.
//!
//! Hosts the chunking-aware batched inference pipeline shared by the HTTP
//! surface: chunker, model registry, per-model batch scheduler, inference
//! executor, response assembler, plus health, metrics and configuration.

mod assembler;
mod chunker;
mod config;
mod executor;
mod health;
pub mod metrics;
mod pipeline;
mod registry;
mod scheduler;

pub use assembler::{l2_normalize, mean_pool, AggregationPolicy, ChunkResult, ResponseAssembler};
pub use chunker::{Chunker, OverlapPolicy};
pub use config::{
    BackendKind, BatchingConfig, ChunkingConfig, Config, ConfigError, LoggingConfig, ModelConfig,
    ServerConfig,
};
pub use executor::InferenceExecutor;
pub use health::{HealthMonitor, HealthReport, ModelHealth};
pub use metrics::{ModelCounters, PipelineMetrics};
pub use pipeline::{EmbeddingRequest, EmbeddingService, ServiceOptions};
pub use registry::{ModelHandle, ModelRegistry};
pub use scheduler::{BatchScheduler, PendingChunk, SchedulerConfig};
