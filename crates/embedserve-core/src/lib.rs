//! Core domain types shared by the embedserve pipeline and its HTTP surface.

pub mod chunk;
pub mod error;
pub mod model;
pub mod response;

pub use chunk::{Chunk, TokenSpan};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use model::{ModelDescriptor, ModelStatus};
pub use response::{EmbeddingResponse, ItemError, ResponseItem, Usage};
