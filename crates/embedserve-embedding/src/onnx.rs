//! ONNX Runtime embedding backend.
//!
//! Runs sentence-transformer style models exported to ONNX. The graph takes
//! `input_ids`, `attention_mask` and `token_type_ids` of shape
//! `[batch, seq_len]` and returns `last_hidden_state`; sentence vectors are the
//! attention-masked mean over the sequence axis.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::Array2;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tracing::info;

use crate::provider::{EmbeddingBackend, ModelLoader};
use crate::types::{EmbeddingError, EmbeddingResult, ForwardBatch};

/// Configuration for the ONNX backend.
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    /// Path to the ONNX model file
    pub model_path: PathBuf,
    /// Path to tokenizer.json
    pub tokenizer_path: PathBuf,
    /// Model name (for metadata)
    pub model_name: String,
    /// Output embedding dimension
    pub dimension: usize,
    /// Maximum sequence length
    pub max_sequence_length: usize,
    /// Intra-op threads per session
    pub intra_threads: usize,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/model.onnx"),
            tokenizer_path: PathBuf::from("models/tokenizer.json"),
            model_name: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            max_sequence_length: 256,
            intra_threads: 4,
        }
    }
}

/// ONNX Runtime backend.
pub struct OnnxBackend {
    /// `Session::run` requires `&mut self`
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    config: OnnxConfig,
}

impl OnnxBackend {
    /// Builds the session and tokenizer. Blocking; call from a blocking context.
    ///
    /// # Errors
    ///
    /// Returns `EmbeddingError::ModelNotFound` if either artifact is missing or
    /// unreadable.
    pub fn from_config(config: OnnxConfig) -> EmbeddingResult<Self> {
        if !config.model_path.exists() {
            return Err(EmbeddingError::ModelNotFound(format!(
                "model file not found: {}",
                config.model_path.display()
            )));
        }
        if !config.tokenizer_path.exists() {
            return Err(EmbeddingError::ModelNotFound(format!(
                "tokenizer file not found: {}",
                config.tokenizer_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| EmbeddingError::Internal(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EmbeddingError::Internal(format!("Failed to set optimization level: {e}")))?
            .with_intra_threads(config.intra_threads)
            .map_err(|e| EmbeddingError::Internal(format!("Failed to set threads: {e}")))?
            .commit_from_file(&config.model_path)
            .map_err(|e| EmbeddingError::ModelNotFound(format!("Failed to load ONNX model: {e}")))?;

        let tokenizer = Tokenizer::from_file(&config.tokenizer_path)
            .map_err(|e| EmbeddingError::ModelNotFound(format!("Failed to load tokenizer: {e}")))?;

        info!(
            model = %config.model_name,
            dimension = config.dimension,
            max_sequence_length = config.max_sequence_length,
            "ONNX session ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            config,
        })
    }

    fn tensor(
        batch: usize,
        width: usize,
        data: Vec<i64>,
        what: &str,
    ) -> EmbeddingResult<Value> {
        let array = Array2::from_shape_vec((batch, width), data)
            .map_err(|e| EmbeddingError::Internal(format!("Failed to create {what} tensor: {e}")))?;
        Value::from_array(array)
            .map(|tensor| tensor.into_dyn())
            .map_err(|e| EmbeddingError::Internal(format!("Failed to create {what} value: {e}")))
    }
}

impl EmbeddingBackend for OnnxBackend {
    fn name(&self) -> &str {
        &self.config.model_name
    }

    fn tokenize(&self, text: &str) -> EmbeddingResult<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EmbeddingError::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn forward(&self, batch: &ForwardBatch) -> EmbeddingResult<Vec<Vec<f32>>> {
        if batch.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty batch".to_string()));
        }
        if !batch.is_rectangular() {
            return Err(EmbeddingError::InvalidInput(
                "batch is not padded to a common width".to_string(),
            ));
        }

        let batch_size = batch.len();
        let width = batch.width();
        let mask = batch.attention_mask();

        let input_ids: Vec<i64> = batch
            .sequences
            .iter()
            .flat_map(|s| s.iter().map(|&id| i64::from(id)))
            .collect();
        let attention_mask: Vec<i64> = mask
            .iter()
            .flat_map(|m| m.iter().map(|&v| i64::from(v)))
            .collect();
        let token_type_ids = vec![0i64; batch_size * width];

        let input_ids = Self::tensor(batch_size, width, input_ids, "input_ids")?;
        let attention_mask_value =
            Self::tensor(batch_size, width, attention_mask.clone(), "attention_mask")?;
        let token_type_ids = Self::tensor(batch_size, width, token_type_ids, "token_type_ids")?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask_value,
                "token_type_ids" => token_type_ids
            ])
            .map_err(|e| EmbeddingError::ResourceExhausted(format!("ONNX inference failed: {e}")))?;

        let (hidden_shape, hidden_data) = outputs["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::Internal(format!("Failed to extract output: {e}")))?;

        // [batch, seq_len, hidden]
        if hidden_shape.len() != 3 {
            return Err(EmbeddingError::Internal(format!(
                "Unexpected output shape: {hidden_shape:?}"
            )));
        }
        let hidden_size = hidden_shape[2] as usize;

        let mut embeddings = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            let mut pooled = vec![0.0f32; hidden_size];
            let mut sum_mask = 0.0f32;

            for j in 0..width {
                let mask_val = attention_mask[i * width + j] as f32;
                if mask_val == 0.0 {
                    continue;
                }
                sum_mask += mask_val;
                let offset = (i * width + j) * hidden_size;
                for (k, value) in pooled.iter_mut().enumerate() {
                    *value += hidden_data[offset + k] * mask_val;
                }
            }

            if sum_mask > 0.0 {
                for value in &mut pooled {
                    *value /= sum_mask;
                }
            }
            embeddings.push(pooled);
        }

        Ok(embeddings)
    }

    fn max_sequence_length(&self) -> usize {
        self.config.max_sequence_length
    }

    fn embedding_dim(&self) -> usize {
        self.config.dimension
    }

    fn requires_fixed_shape(&self) -> bool {
        true
    }

    fn pad_token_id(&self) -> u32 {
        self.tokenizer
            .get_padding()
            .map_or(0, |padding| padding.pad_id)
    }
}

/// Loads an [`OnnxBackend`] on the blocking pool.
pub struct OnnxLoader {
    config: OnnxConfig,
}

impl OnnxLoader {
    #[must_use]
    pub fn new(config: OnnxConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &OnnxConfig {
        &self.config
    }
}

#[async_trait]
impl ModelLoader for OnnxLoader {
    async fn load(&self) -> EmbeddingResult<Arc<dyn EmbeddingBackend>> {
        let config = self.config.clone();
        let backend = tokio::task::spawn_blocking(move || OnnxBackend::from_config(config))
            .await
            .map_err(|e| EmbeddingError::Internal(format!("model load task failed: {e}")))??;
        Ok(Arc::new(backend))
    }
}
