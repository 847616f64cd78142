//! Configuration management for embedserve.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Environment variables (highest priority)
//! 2. TOML configuration file (`config.toml` or `$EMBEDSERVE_CONFIG`)
//! 3. Default values (lowest priority)

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use embedserve_embedding::{MockBackend, MockLoader, ModelLoader};
use serde::{Deserialize, Serialize};

use crate::assembler::AggregationPolicy;
use crate::chunker::OverlapPolicy;

/// Main configuration structure for the embedding server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Batch scheduler bounds
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Chunking and aggregation
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Models registered at startup
    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration (host, port, request limits)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address (default: "0.0.0.0")
    #[serde(default = "default_host")]
    pub host: String,

    /// REST API port (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-request deadline in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub request_timeout_seconds: u64,

    /// Maximum documents per request (default: 2048)
    #[serde(default = "default_max_inputs")]
    pub max_inputs_per_request: usize,
}

/// Batch scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Flush when this many chunks are pending (default: 32)
    #[serde(default = "default_max_batch_chunks")]
    pub max_batch_chunks: usize,

    /// Flush when pending chunks hold this many tokens (default: 16384)
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,

    /// Flush when the oldest pending chunk has waited this long (default: 5ms)
    #[serde(default = "default_max_batch_wait_ms")]
    pub max_batch_wait_ms: u64,

    /// Reject new chunks beyond this many queued per model (default: 1024)
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Inference workers shared by all models; 0 uses available parallelism (default: 0)
    #[serde(default)]
    pub workers: usize,
}

/// Chunking configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Fixed overlap in tokens; takes precedence over `overlap_fraction`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_tokens: Option<usize>,

    /// Overlap as a fraction of `max_sequence_length` (default: 0.1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_fraction: Option<f32>,

    /// Multi-chunk aggregation policy (default: none)
    #[serde(default)]
    pub aggregation: AggregationPolicy,
}

/// Backend implementation of a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Deterministic in-process backend
    #[default]
    Mock,
    /// ONNX Runtime (requires the `onnx` feature)
    Onnx,
}

/// One model served by the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registered model name
    pub name: String,

    /// Backend implementation (default: mock)
    #[serde(default)]
    pub backend: BackendKind,

    /// Maximum tokens per chunk (default: 256)
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,

    /// Output vector dimension (default: 384)
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// ONNX model file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    /// tokenizer.json
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<PathBuf>,

    /// Extra names resolving to this model
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Simulated forward latency of the mock backend
    #[serde(default)]
    pub mock_latency_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty (default: "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_timeout() -> u64 {
    30
}

fn default_max_inputs() -> usize {
    2048
}

fn default_max_batch_chunks() -> usize {
    32
}

fn default_max_batch_tokens() -> usize {
    16_384
}

fn default_max_batch_wait_ms() -> u64 {
    5
}

fn default_max_queue_depth() -> usize {
    1024
}

fn default_max_sequence_length() -> usize {
    MockBackend::DEFAULT_MAX_SEQUENCE_LENGTH
}

fn default_dimension() -> usize {
    MockBackend::DEFAULT_DIMENSION
}

fn default_models() -> Vec<ModelConfig> {
    vec![ModelConfig::mock(MockBackend::DEFAULT_MODEL)]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            batching: BatchingConfig::default(),
            chunking: ChunkingConfig::default(),
            models: default_models(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_timeout(),
            max_inputs_per_request: default_max_inputs(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_chunks: default_max_batch_chunks(),
            max_batch_tokens: default_max_batch_tokens(),
            max_batch_wait_ms: default_max_batch_wait_ms(),
            max_queue_depth: default_max_queue_depth(),
            workers: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl BatchingConfig {
    #[must_use]
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    /// Worker pool size, resolving 0 to the available compute units.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

impl ChunkingConfig {
    #[must_use]
    pub fn overlap_policy(&self) -> OverlapPolicy {
        match (self.overlap_tokens, self.overlap_fraction) {
            (Some(tokens), _) => OverlapPolicy::Tokens(tokens),
            (None, Some(fraction)) => OverlapPolicy::Fraction(fraction),
            (None, None) => OverlapPolicy::default(),
        }
    }
}

impl ModelConfig {
    /// A mock model with default limits.
    #[must_use]
    pub fn mock(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: BackendKind::Mock,
            max_sequence_length: default_max_sequence_length(),
            dimension: default_dimension(),
            model_path: None,
            tokenizer_path: None,
            aliases: Vec::new(),
            mock_latency_ms: 0,
        }
    }

    /// Builds the loader for this model's backend.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the backend is not available
    /// in this build or lacks required paths.
    pub fn loader(&self) -> Result<Arc<dyn ModelLoader>, ConfigError> {
        match self.backend {
            BackendKind::Mock => {
                let backend = MockBackend::with_model(
                    self.name.clone(),
                    self.dimension,
                    self.max_sequence_length,
                )
                .with_latency(Duration::from_millis(self.mock_latency_ms));
                Ok(Arc::new(MockLoader::new(backend)))
            }
            BackendKind::Onnx => self.onnx_loader(),
        }
    }

    #[cfg(feature = "onnx")]
    fn onnx_loader(&self) -> Result<Arc<dyn ModelLoader>, ConfigError> {
        use embedserve_embedding::{OnnxConfig, OnnxLoader};

        let (Some(model_path), Some(tokenizer_path)) = (&self.model_path, &self.tokenizer_path)
        else {
            return Err(ConfigError::ValidationError(format!(
                "model `{}`: onnx backend requires model_path and tokenizer_path",
                self.name
            )));
        };
        Ok(Arc::new(OnnxLoader::new(OnnxConfig {
            model_path: model_path.clone(),
            tokenizer_path: tokenizer_path.clone(),
            model_name: self.name.clone(),
            dimension: self.dimension,
            max_sequence_length: self.max_sequence_length,
            ..OnnxConfig::default()
        })))
    }

    #[cfg(not(feature = "onnx"))]
    fn onnx_loader(&self) -> Result<Arc<dyn ModelLoader>, ConfigError> {
        Err(ConfigError::ValidationError(format!(
            "model `{}`: onnx backend requires building with the `onnx` feature",
            self.name
        )))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file doesn't exist or has invalid TOML syntax.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::TomlError { path, source: e })
    }

    /// Load, override from the environment and validate.
    ///
    /// Reads `$EMBEDSERVE_CONFIG` if set (the file must exist), otherwise
    /// `config.toml` when present, otherwise defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(path) = std::env::var("EMBEDSERVE_CONFIG") {
            Self::from_file(path)?
        } else if std::path::Path::new("config.toml").exists() {
            Self::from_file("config.toml")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `EMBEDSERVE_HOST`, `EMBEDSERVE_PORT`
    /// - `EMBEDSERVE_MAX_BATCH_CHUNKS`, `EMBEDSERVE_MAX_BATCH_TOKENS`,
    ///   `EMBEDSERVE_MAX_BATCH_WAIT_MS`, `EMBEDSERVE_MAX_QUEUE_DEPTH`, `EMBEDSERVE_WORKERS`
    /// - `EMBEDSERVE_OVERLAP_TOKENS`
    /// - `EMBEDSERVE_LOG_LEVEL`, `EMBEDSERVE_LOG_FORMAT`
    ///
    /// Unparsable numeric values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("EMBEDSERVE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("EMBEDSERVE_PORT") {
            self.server.port = port;
        }
        if let Some(chunks) = env_parse("EMBEDSERVE_MAX_BATCH_CHUNKS") {
            self.batching.max_batch_chunks = chunks;
        }
        if let Some(tokens) = env_parse("EMBEDSERVE_MAX_BATCH_TOKENS") {
            self.batching.max_batch_tokens = tokens;
        }
        if let Some(wait) = env_parse("EMBEDSERVE_MAX_BATCH_WAIT_MS") {
            self.batching.max_batch_wait_ms = wait;
        }
        if let Some(depth) = env_parse("EMBEDSERVE_MAX_QUEUE_DEPTH") {
            self.batching.max_queue_depth = depth;
        }
        if let Some(workers) = env_parse("EMBEDSERVE_WORKERS") {
            self.batching.workers = workers;
        }
        if let Some(overlap) = env_parse("EMBEDSERVE_OVERLAP_TOKENS") {
            self.chunking.overlap_tokens = Some(overlap);
        }
        if let Ok(level) = std::env::var("EMBEDSERVE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("EMBEDSERVE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be non-zero".to_string(),
            ));
        }

        if self.server.request_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "server.request_timeout_seconds must be > 0".to_string(),
            ));
        }

        if self.server.max_inputs_per_request == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_inputs_per_request must be > 0".to_string(),
            ));
        }

        if self.batching.max_batch_chunks == 0
            || self.batching.max_batch_tokens == 0
            || self.batching.max_queue_depth == 0
        {
            return Err(ConfigError::ValidationError(
                "batching.max_batch_chunks, max_batch_tokens and max_queue_depth must be > 0"
                    .to_string(),
            ));
        }

        if let Some(fraction) = self.chunking.overlap_fraction {
            if !(0.0..1.0).contains(&fraction) {
                return Err(ConfigError::ValidationError(
                    "chunking.overlap_fraction must be in [0, 1)".to_string(),
                ));
            }
        }

        if self.models.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one [[models]] entry is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "models.name cannot be empty".to_string(),
                ));
            }
            for name in std::iter::once(&model.name).chain(&model.aliases) {
                if !names.insert(name.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "duplicate model name or alias `{name}`"
                    )));
                }
            }
            if model.max_sequence_length == 0 || model.dimension == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "model `{}`: max_sequence_length and dimension must be > 0",
                    model.name
                )));
            }
            if let Some(overlap) = self.chunking.overlap_tokens {
                if overlap >= model.max_sequence_length {
                    return Err(ConfigError::ValidationError(format!(
                        "chunking.overlap_tokens ({overlap}) must be < max_sequence_length of model `{}` ({})",
                        model.name, model.max_sequence_length
                    )));
                }
            }
            if model.backend == BackendKind::Onnx {
                model.loader()?;
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.format must be one of: {}",
                valid_formats.join(", ")
            )));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file
    #[error("Failed to read config file {path:?}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("Failed to parse TOML in {path:?}: {source}")]
    TomlError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
