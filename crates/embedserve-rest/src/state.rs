use std::sync::Arc;

use embedserve_service::{EmbeddingService, HealthMonitor};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EmbeddingService>,
    pub health: HealthMonitor,
}

impl AppState {
    #[must_use]
    pub fn new(service: Arc<EmbeddingService>) -> Self {
        let health = service.health();
        Self { service, health }
    }
}
