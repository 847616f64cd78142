//! Prometheus metrics for the embedding pipeline.
//!
//! Metrics live in a registry owned by [`PipelineMetrics`] rather than the
//! process-global one, so several services (and tests) can coexist in one
//! process. Label values for a model are created when it is registered, so its
//! name shows up in the exposition with zero counters before any traffic.

use std::time::Duration;

use embedserve_core::ErrorKind;
use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, HistogramVec, IntCounterVec, IntGaugeVec,
    Registry, TextEncoder,
};
use serde::Serialize;

/// Snapshot of one model's counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelCounters {
    /// Completed requests
    pub requests: u64,
    /// Chunks that produced an embedding
    pub chunks: u64,
    /// Cumulative request latency
    pub latency_seconds_total: f64,
    /// `latency_seconds_total / requests`, zero before the first request
    pub average_latency_seconds: f64,
}

/// Process-scoped counters, gauges and histograms of the pipeline.
pub struct PipelineMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    chunks_processed_total: IntCounterVec,
    request_latency_seconds_total: CounterVec,
    request_duration_seconds: HistogramVec,
    batches_total: IntCounterVec,
    batch_size: HistogramVec,
    errors_total: IntCounterVec,
    queue_depth: IntGaugeVec,
    model_ready: IntGaugeVec,
}

impl PipelineMetrics {
    /// Creates and registers every metric.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric descriptor is invalid.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!("embedserve_requests_total", "Completed embedding requests"),
            &["model"],
        )?;
        let chunks_processed_total = IntCounterVec::new(
            opts!("embedserve_chunks_processed_total", "Chunks embedded successfully"),
            &["model"],
        )?;
        let request_latency_seconds_total = CounterVec::new(
            opts!(
                "embedserve_request_latency_seconds_total",
                "Cumulative latency of completed requests in seconds"
            ),
            &["model"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "embedserve_request_duration_seconds",
                "Embedding request latency in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["model"],
        )?;
        let batches_total = IntCounterVec::new(
            opts!("embedserve_batches_total", "Inference batches executed"),
            &["model"],
        )?;
        let batch_size = HistogramVec::new(
            histogram_opts!(
                "embedserve_batch_size",
                "Chunks per inference batch",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0]
            ),
            &["model"],
        )?;
        let errors_total = IntCounterVec::new(
            opts!("embedserve_errors_total", "Pipeline errors by kind"),
            &["model", "kind"],
        )?;
        let queue_depth = IntGaugeVec::new(
            opts!("embedserve_queue_depth", "Chunks waiting in the batch queue"),
            &["model"],
        )?;
        let model_ready = IntGaugeVec::new(
            opts!("embedserve_model_ready", "1 when the model is ready to serve"),
            &["model"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(chunks_processed_total.clone()))?;
        registry.register(Box::new(request_latency_seconds_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(batches_total.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(model_ready.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            chunks_processed_total,
            request_latency_seconds_total,
            request_duration_seconds,
            batches_total,
            batch_size,
            errors_total,
            queue_depth,
            model_ready,
        })
    }

    /// Creates the label values of `model` with zero counts.
    pub fn register_model(&self, model: &str) {
        self.requests_total.with_label_values(&[model]);
        self.chunks_processed_total.with_label_values(&[model]);
        self.request_latency_seconds_total.with_label_values(&[model]);
        self.batches_total.with_label_values(&[model]);
        self.queue_depth.with_label_values(&[model]).set(0);
        self.model_ready.with_label_values(&[model]).set(0);
    }

    /// Records one completed request.
    pub fn record_request(&self, model: &str, latency: Duration) {
        let seconds = latency.as_secs_f64();
        self.requests_total.with_label_values(&[model]).inc();
        self.request_latency_seconds_total
            .with_label_values(&[model])
            .inc_by(seconds);
        self.request_duration_seconds
            .with_label_values(&[model])
            .observe(seconds);
    }

    /// Records `count` successfully embedded chunks.
    pub fn record_chunks(&self, model: &str, count: usize) {
        self.chunks_processed_total
            .with_label_values(&[model])
            .inc_by(count as u64);
    }

    /// Records one executed batch.
    pub fn record_batch(&self, model: &str, size: usize) {
        self.batches_total.with_label_values(&[model]).inc();
        self.batch_size.with_label_values(&[model]).observe(size as f64);
    }

    pub fn record_error(&self, model: &str, kind: ErrorKind) {
        self.record_errors(model, kind, 1);
    }

    pub fn record_errors(&self, model: &str, kind: ErrorKind, count: usize) {
        if count > 0 {
            self.errors_total
                .with_label_values(&[model, kind.as_str()])
                .inc_by(count as u64);
        }
    }

    pub fn set_queue_depth(&self, model: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[model])
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn set_ready(&self, model: &str, ready: bool) {
        self.model_ready
            .with_label_values(&[model])
            .set(i64::from(ready));
    }

    /// Current counters of `model`.
    #[must_use]
    pub fn counters(&self, model: &str) -> ModelCounters {
        let requests = self.requests_total.with_label_values(&[model]).get();
        let latency_seconds_total = self
            .request_latency_seconds_total
            .with_label_values(&[model])
            .get();
        let average_latency_seconds = if requests == 0 {
            0.0
        } else {
            latency_seconds_total / requests as f64
        };

        ModelCounters {
            requests,
            chunks: self.chunks_processed_total.with_label_values(&[model]).get(),
            latency_seconds_total,
            average_latency_seconds,
        }
    }

    /// Errors of `kind` recorded for `model`.
    #[must_use]
    pub fn error_count(&self, model: &str, kind: ErrorKind) -> u64 {
        self.errors_total
            .with_label_values(&[model, kind.as_str()])
            .get()
    }

    /// Exports all metrics in Prometheus text format.
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }

        String::from_utf8(buffer).unwrap_or_else(|e| {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            String::new()
        })
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_model_appears_before_traffic() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.register_model("all-MiniLM-L6-v2");

        let output = metrics.export_prometheus();
        assert!(output.contains("embedserve_requests_total{model=\"all-MiniLM-L6-v2\"} 0"));
        assert!(output.contains("embedserve_model_ready"));
    }

    #[test]
    fn test_counters_and_average() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.register_model("m");
        assert_eq!(metrics.counters("m").average_latency_seconds, 0.0);

        metrics.record_request("m", Duration::from_millis(100));
        metrics.record_request("m", Duration::from_millis(300));
        metrics.record_chunks("m", 5);

        let counters = metrics.counters("m");
        assert_eq!(counters.requests, 2);
        assert_eq!(counters.chunks, 5);
        assert!((counters.latency_seconds_total - 0.4).abs() < 1e-9);
        assert!((counters.average_latency_seconds - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_error_counter_by_kind() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_errors("m", ErrorKind::Overloaded, 3);
        metrics.record_errors("m", ErrorKind::Overloaded, 0);
        assert_eq!(metrics.error_count("m", ErrorKind::Overloaded), 3);
        assert!(metrics
            .export_prometheus()
            .contains("kind=\"overloaded\""));
    }

    #[test]
    fn test_independent_registries() {
        let a = PipelineMetrics::new().unwrap();
        let b = PipelineMetrics::new().unwrap();
        a.record_chunks("m", 1);
        assert_eq!(b.counters("m").chunks, 0);
    }
}
