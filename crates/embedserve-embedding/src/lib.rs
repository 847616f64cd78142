//! Embedding backend infrastructure for embedserve.
//!
//! This crate defines the capability interface the pipeline drives
//! (`EmbeddingBackend`: tokenize, forward, limits) and the asynchronous
//! `ModelLoader` used by the model registry. Backends are selected by
//! configuration; the pipeline never branches on model identity.

mod mock;
#[cfg(feature = "onnx")]
pub mod onnx;
mod provider;
mod types;

pub use mock::{MockBackend, MockLoader};
#[cfg(feature = "onnx")]
pub use onnx::{OnnxBackend, OnnxConfig, OnnxLoader};
pub use provider::{EmbeddingBackend, ModelLoader};
pub use types::{BackendInfo, EmbeddingError, EmbeddingResult, ForwardBatch};
