//! Liveness, readiness and metrics exposition.

use std::sync::Arc;
use std::time::Instant;

use embedserve_core::ModelDescriptor;
use serde::Serialize;

use crate::metrics::{ModelCounters, PipelineMetrics};
use crate::registry::ModelRegistry;

/// Point-in-time health of the process.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub alive: bool,
    pub ready: bool,
    pub uptime_seconds: u64,
    pub models: Vec<ModelHealth>,
}

/// Health of one registered model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelHealth {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    pub counters: ModelCounters,
}

/// Observes the registry and metrics without touching the request path.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    registry: Arc<ModelRegistry>,
    metrics: Arc<PipelineMetrics>,
    started_at: Instant,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            registry,
            metrics,
            started_at: Instant::now(),
        }
    }

    /// Always true once the process is serving.
    #[must_use]
    pub fn alive(&self) -> bool {
        true
    }

    /// True when every registered model is `Ready`.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.registry.all_ready()
    }

    #[must_use]
    pub fn report(&self) -> HealthReport {
        let models = self
            .registry
            .handles()
            .iter()
            .map(|handle| ModelHealth {
                descriptor: handle.descriptor(),
                counters: self.metrics.counters(handle.name()),
            })
            .collect();

        HealthReport {
            alive: self.alive(),
            ready: self.ready(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            models,
        }
    }

    /// Prometheus text exposition, with readiness gauges refreshed first.
    #[must_use]
    pub fn render_metrics(&self) -> String {
        for handle in self.registry.handles() {
            self.metrics.set_ready(handle.name(), handle.is_ready());
        }
        self.metrics.export_prometheus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedserve_embedding::{MockBackend, MockLoader};

    #[tokio::test]
    async fn test_health_tracks_registry() {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let registry = Arc::new(ModelRegistry::new(metrics.clone()));
        let monitor = HealthMonitor::new(registry.clone(), metrics);

        assert!(monitor.alive());
        assert!(!monitor.ready());

        let handle = registry
            .register(
                "sentence-transformers/all-MiniLM-L6-v2",
                vec![],
                Arc::new(MockLoader::new(MockBackend::new())),
            )
            .unwrap();
        handle.wait_settled().await;

        assert!(monitor.ready());
        let report = monitor.report();
        assert_eq!(report.models.len(), 1);
        assert_eq!(report.models[0].counters.requests, 0);

        let text = monitor.render_metrics();
        assert!(text.contains("all-MiniLM-L6-v2"));
        assert!(text.contains("embedserve_model_ready{model=\"sentence-transformers/all-MiniLM-L6-v2\"} 1"));
    }
}
