pub mod embeddings;
pub mod health; // Kubernetes liveness and readiness probes
pub mod metrics;
pub mod models;

pub use embeddings::{embeddings_handler, EmbeddingInput, EmbeddingsBody};
pub use health::{alive_handler, health_handler, ready_handler};
pub use metrics::metrics_handler;
pub use models::{info_handler, list_models_handler, InfoQuery};
