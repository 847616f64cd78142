//! Model registry: lifecycle and name resolution of loaded backends.
//!
//! `register` returns immediately with a `Loading` handle while a background
//! task runs the model's loader. The handle's status is a single atomic, so
//! every stage sees a transition at the same time; the backend is published
//! before the status flips to `Ready` and is never handed out earlier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use embedserve_core::{ModelDescriptor, ModelStatus, PipelineError, PipelineResult};
use embedserve_embedding::{EmbeddingBackend, ModelLoader};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::metrics::PipelineMetrics;

/// Shared, read-only view of one registered model.
pub struct ModelHandle {
    name: String,
    aliases: Vec<String>,
    status: AtomicU8,
    backend: OnceCell<Arc<dyn EmbeddingBackend>>,
    error: OnceCell<String>,
    settled: Notify,
}

impl ModelHandle {
    fn new(name: String, aliases: Vec<String>) -> Self {
        Self {
            name,
            aliases,
            status: AtomicU8::new(ModelStatus::Unloaded.as_u8()),
            backend: OnceCell::new(),
            error: OnceCell::new(),
            settled: Notify::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    #[must_use]
    pub fn status(&self) -> ModelStatus {
        ModelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status() == ModelStatus::Ready
    }

    /// The backend, only once the handle is `Ready`.
    #[must_use]
    pub fn backend(&self) -> Option<Arc<dyn EmbeddingBackend>> {
        if self.is_ready() {
            self.backend.get().cloned()
        } else {
            None
        }
    }

    /// Load failure reason of a `Failed` handle.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }

    #[must_use]
    pub fn max_sequence_length(&self) -> Option<usize> {
        self.backend().map(|b| b.max_sequence_length())
    }

    #[must_use]
    pub fn embedding_dim(&self) -> Option<usize> {
        self.backend().map(|b| b.embedding_dim())
    }

    #[must_use]
    pub fn descriptor(&self) -> ModelDescriptor {
        let backend = self.backend();
        ModelDescriptor {
            name: self.name.clone(),
            aliases: self.aliases.clone(),
            status: self.status(),
            max_sequence_length: backend.as_ref().map(|b| b.max_sequence_length()),
            embedding_dim: backend.as_ref().map(|b| b.embedding_dim()),
            error: self.error().map(str::to_string),
        }
    }

    /// Backend of a `Ready` handle, or the error a request against it fails with.
    ///
    /// # Errors
    ///
    /// `ModelNotReady` while loading, `ModelLoad` once failed.
    pub fn require_ready(&self) -> PipelineResult<Arc<dyn EmbeddingBackend>> {
        match self.status() {
            ModelStatus::Ready => self
                .backend()
                .ok_or_else(|| PipelineError::internal("ready handle without backend")),
            ModelStatus::Failed => Err(PipelineError::ModelLoad {
                name: self.name.clone(),
                message: self.error().unwrap_or("unknown error").to_string(),
            }),
            status @ (ModelStatus::Unloaded | ModelStatus::Loading) => {
                Err(PipelineError::ModelNotReady {
                    name: self.name.clone(),
                    status: status.to_string(),
                })
            }
        }
    }

    /// Resolves once the handle is `Ready` or `Failed`.
    pub async fn wait_settled(&self) -> ModelStatus {
        loop {
            let notified = self.settled.notified();
            let status = self.status();
            if matches!(status, ModelStatus::Ready | ModelStatus::Failed) {
                return status;
            }
            notified.await;
        }
    }

    fn transition(&self, next: ModelStatus) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                ModelStatus::from_u8(current)
                    .can_transition_to(next)
                    .then_some(next.as_u8())
            })
            .is_ok()
    }

    fn complete(&self, result: Result<Arc<dyn EmbeddingBackend>, String>) -> ModelStatus {
        let next = match result {
            Ok(backend) => {
                let info = backend.info();
                if info.dimension == 0 || info.max_sequence_length == 0 {
                    let _ = self.error.set(format!(
                        "backend `{}` reported zero dimension or sequence length",
                        info.model
                    ));
                    ModelStatus::Failed
                } else {
                    let _ = self.backend.set(backend);
                    ModelStatus::Ready
                }
            }
            Err(message) => {
                let _ = self.error.set(message);
                ModelStatus::Failed
            }
        };
        if !self.transition(next) {
            warn!(model = %self.name, status = %self.status(), "Ignored invalid status transition");
        }
        self.settled.notify_waiters();
        self.status()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Name → handle map shared by all stages.
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<ModelHandle>>>,
    aliases: RwLock<HashMap<String, String>>,
    metrics: Arc<PipelineMetrics>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Registers `name` and starts loading it in the background.
    ///
    /// Returns a `Loading` handle. Registering an existing name replaces the
    /// previous handle with a fresh one. Besides `aliases`, a name of the form
    /// `org/model` is also reachable as `model`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Internal` when called outside a Tokio runtime.
    pub fn register(
        &self,
        name: impl Into<String>,
        aliases: Vec<String>,
        loader: Arc<dyn ModelLoader>,
    ) -> PipelineResult<Arc<ModelHandle>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PipelineError::internal(format!("model registration needs a runtime: {e}")))?;

        let name = name.into();
        let handle = Arc::new(ModelHandle::new(name.clone(), aliases.clone()));
        handle.transition(ModelStatus::Loading);

        {
            let mut models = self.models.write();
            let mut alias_map = self.aliases.write();
            let short = name.rsplit_once('/').map(|(_, short)| short.to_string());
            for alias in aliases.into_iter().chain(short) {
                if alias != name && !models.contains_key(&alias) {
                    alias_map.insert(alias, name.clone());
                }
            }
            alias_map.remove(&name);
            models.insert(name.clone(), handle.clone());
        }

        self.metrics.register_model(&name);
        self.metrics.set_ready(&name, false);
        info!(model = %name, "Model registered, loading");

        let task_handle = handle.clone();
        let metrics = self.metrics.clone();
        runtime.spawn(async move {
            let result = loader.load().await.map_err(|e| e.to_string());
            let status = task_handle.complete(result);
            metrics.set_ready(task_handle.name(), status == ModelStatus::Ready);
            match status {
                ModelStatus::Ready => info!(
                    model = %task_handle.name(),
                    dimension = task_handle.embedding_dim().unwrap_or(0),
                    max_sequence_length = task_handle.max_sequence_length().unwrap_or(0),
                    "Model ready"
                ),
                _ => error!(
                    model = %task_handle.name(),
                    error = task_handle.error().unwrap_or("unknown error"),
                    "Model failed to load"
                ),
            }
        });

        Ok(handle)
    }

    /// Canonical name for `name` or one of its aliases.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<String> {
        if self.models.read().contains_key(name) {
            return Some(name.to_string());
        }
        self.aliases.read().get(name).cloned()
    }

    /// Looks up a handle by name or alias.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::UnknownModel` if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> PipelineResult<Arc<ModelHandle>> {
        let canonical = self
            .resolve(name)
            .ok_or_else(|| PipelineError::unknown_model(name))?;
        self.models
            .read()
            .get(&canonical)
            .cloned()
            .ok_or_else(|| PipelineError::unknown_model(name))
    }

    /// Whether `name` resolves to a `Ready` model.
    #[must_use]
    pub fn is_ready(&self, name: &str) -> bool {
        self.get(name).map(|h| h.is_ready()).unwrap_or(false)
    }

    /// Process readiness: at least one model registered and all of them `Ready`.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        let models = self.models.read();
        !models.is_empty() && models.values().all(|h| h.is_ready())
    }

    /// All handles, ordered by name.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<ModelHandle>> {
        let mut handles: Vec<_> = self.models.read().values().cloned().collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        handles
    }

    #[must_use]
    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.handles().iter().map(|h| h.descriptor()).collect()
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedserve_embedding::{MockBackend, MockLoader};

    fn registry() -> ModelRegistry {
        ModelRegistry::new(Arc::new(PipelineMetrics::new().unwrap()))
    }

    #[tokio::test]
    async fn test_register_loading_then_ready() {
        let registry = registry();
        let gate = Arc::new(Notify::new());
        let loader = MockLoader::new(MockBackend::new()).with_gate(gate.clone());

        let handle = registry
            .register("sentence-transformers/all-MiniLM-L6-v2", vec![], Arc::new(loader))
            .unwrap();
        assert_eq!(handle.status(), ModelStatus::Loading);
        assert!(!registry.all_ready());
        assert!(handle.backend().is_none());
        assert!(matches!(
            handle.require_ready(),
            Err(PipelineError::ModelNotReady { .. })
        ));

        gate.notify_one();
        assert_eq!(handle.wait_settled().await, ModelStatus::Ready);
        assert!(registry.all_ready());
        assert_eq!(handle.embedding_dim(), Some(384));
    }

    #[tokio::test]
    async fn test_failed_load_is_terminal() {
        let registry = registry();
        let handle = registry
            .register("broken", vec![], Arc::new(MockLoader::failing("no weights")))
            .unwrap();

        assert_eq!(handle.wait_settled().await, ModelStatus::Failed);
        assert!(!registry.is_ready("broken"));
        assert!(handle.error().unwrap().contains("no weights"));
        assert!(!handle.transition(ModelStatus::Ready));
        assert!(matches!(
            handle.require_ready(),
            Err(PipelineError::ModelLoad { .. })
        ));

        // re-registration creates a fresh handle
        let fresh = registry
            .register("broken", vec![], Arc::new(MockLoader::new(MockBackend::new())))
            .unwrap();
        assert!(!Arc::ptr_eq(&handle, &fresh));
        assert_eq!(fresh.wait_settled().await, ModelStatus::Ready);
        assert_eq!(handle.status(), ModelStatus::Failed);
        assert!(registry.is_ready("broken"));
    }

    #[tokio::test]
    async fn test_alias_resolution() {
        let registry = registry();
        registry
            .register(
                "sentence-transformers/all-MiniLM-L6-v2",
                vec!["minilm".to_string()],
                Arc::new(MockLoader::new(MockBackend::new())),
            )
            .unwrap();

        let canonical = Some("sentence-transformers/all-MiniLM-L6-v2".to_string());
        assert_eq!(registry.resolve("all-MiniLM-L6-v2"), canonical);
        assert_eq!(registry.resolve("minilm"), canonical);
        assert!(matches!(
            registry.get("nope"),
            Err(PipelineError::UnknownModel { .. })
        ));
    }

    #[test]
    fn test_register_outside_runtime() {
        let registry = registry();
        let result = registry.register("m", vec![], Arc::new(MockLoader::new(MockBackend::new())));
        assert!(matches!(result, Err(PipelineError::Internal { .. })));
    }

    #[test]
    fn test_empty_registry_not_ready() {
        assert!(!registry().all_ready());
    }
}
