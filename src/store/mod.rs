//! Model Store: owns on-disk artifacts and prepares each configured model
//! exactly once before any instance of it can be loaded (spec.md §4.1).

mod progress;

pub use progress::DownloadProgress;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineAdapter, ModelMeta, PrepareCtx};
use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    TextCompletion,
    Embedding,
    ImageToText,
    SpeechToText,
    TextToImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Cpu,
    Gpu,
    Auto,
}

impl Default for DevicePreference {
    fn default() -> Self {
        DevicePreference::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrepareMode {
    Blocking,
    Async,
}

impl Default for PrepareMode {
    fn default() -> Self {
        PrepareMode::Async
    }
}

/// Immutable-after-startup configuration for one model (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub engine: String,
    pub task: TaskKind,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub min_instances: u32,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default)]
    pub prepare: PrepareMode,
    /// Task-specific defaults (sampling params, grammars, tools, preload text).
    #[serde(default)]
    pub defaults: serde_json::Value,
}

fn default_max_instances() -> u32 {
    1
}

fn default_ttl_secs() -> u64 {
    300
}

impl ModelConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn requires_gpu(&self) -> Option<bool> {
        match self.device {
            DevicePreference::Gpu => Some(true),
            DevicePreference::Cpu => Some(false),
            DevicePreference::Auto => None,
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        let valid_id = !self.id.is_empty()
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid_id {
            return Err(PoolError::Config(format!(
                "invalid model id {:?}: must match [A-Za-z0-9_\\-.]+",
                self.id
            )));
        }
        let max = self.max_instances.max(1);
        if max < self.min_instances {
            return Err(PoolError::Config(format!(
                "model {}: maxInstances ({max}) must be >= minInstances ({})",
                self.id, self.min_instances
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Unloaded,
    Preparing,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct StoredModel {
    pub config: ModelConfig,
    pub status: ModelStatus,
    pub meta: Option<ModelMeta>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStatusEntry {
    pub status: ModelStatus,
    pub error: Option<String>,
    pub percent: Option<f64>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta_secs: Option<f64>,
}

/// Snapshot returned by [`ModelStore::get_status`].
pub type StoreStatus = HashMap<String, StoreStatusEntry>;

type PrepareResult = Result<(), String>;

/// Owns every configured model's on-disk readiness state.
pub struct ModelStore {
    engines: HashMap<String, Arc<dyn EngineAdapter>>,
    models: RwLock<HashMap<String, StoredModel>>,
    /// Guarded by a sync mutex, not the `models` async lock, so the
    /// synchronous `onProgress` callback an engine invokes from inside
    /// `prepareModel` can update it without blocking on the async runtime.
    progress: Arc<SyncMutex<HashMap<String, DownloadProgress>>>,
    prepare_semaphore: Arc<Semaphore>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<PrepareResult>>>>,
    shutdown: CancellationToken,
}

impl ModelStore {
    pub fn new(
        configs: Vec<ModelConfig>,
        engines: HashMap<String, Arc<dyn EngineAdapter>>,
        prepare_concurrency: usize,
    ) -> Result<Self, PoolError> {
        let mut models = HashMap::new();
        let mut progress = HashMap::new();
        for config in configs {
            config.validate()?;
            if !engines.contains_key(&config.engine) {
                return Err(PoolError::Config(format!(
                    "model {} references unknown engine {:?}",
                    config.id, config.engine
                )));
            }
            progress.insert(config.id.clone(), DownloadProgress::default());
            models.insert(
                config.id.clone(),
                StoredModel {
                    config,
                    status: ModelStatus::Unloaded,
                    meta: None,
                    error: None,
                },
            );
        }
        Ok(Self {
            engines,
            models: RwLock::new(models),
            progress: Arc::new(SyncMutex::new(progress)),
            prepare_semaphore: Arc::new(Semaphore::new(prepare_concurrency.max(1))),
            inflight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Resolve every `prepare = "blocking"` or `minInstances > 0` model before
    /// returning; schedule the rest in the background. Fails closed for
    /// blocking models; async failures move that model to `error` only.
    pub async fn init(self: &Arc<Self>) -> Result<(), PoolError> {
        let (blocking, background): (Vec<_>, Vec<_>) = {
            let models = self.models.read().await;
            models
                .values()
                .map(|m| m.config.clone())
                .partition(|c| c.prepare == PrepareMode::Blocking || c.min_instances > 0)
        };

        // Run blocking preparations concurrently (bounded by `prepare_semaphore`)
        // rather than one at a time, so `prepareConcurrency` actually governs
        // how many blocking models load in parallel at startup.
        let results = futures::future::join_all(
            blocking
                .iter()
                .map(|config| self.prepare_model(&config.id, CancellationToken::new())),
        )
        .await;
        for result in results {
            result?;
        }

        for config in background {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                let _ = store.prepare_model(&config.id, CancellationToken::new()).await;
            });
        }

        Ok(())
    }

    /// Idempotent: concurrent callers for the same model await the same
    /// in-flight preparation rather than re-running it.
    pub async fn prepare_model(
        &self,
        model_id: &str,
        signal: CancellationToken,
    ) -> Result<(), PoolError> {
        {
            let models = self.models.read().await;
            match models.get(model_id) {
                None => return Err(PoolError::ModelNotFound(model_id.to_string())),
                Some(m) if m.status == ModelStatus::Ready => return Ok(()),
                _ => {}
            }
        }

        let mut receiver = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(model_id) {
                existing.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(model_id.to_string(), rx.clone());
                drop(inflight);
                let combined = self.with_shutdown(signal);
                self.run_prepare(model_id, combined, tx).await;
                let mut inflight = self.inflight.lock().await;
                inflight.remove(model_id);
                rx
            }
        };

        loop {
            if let Some(result) = receiver.borrow().clone() {
                return result.map_err(|message| PoolError::InstanceLoadError {
                    model_id: model_id.to_string(),
                    message,
                });
            }
            if receiver.changed().await.is_err() {
                return Err(PoolError::InstanceLoadError {
                    model_id: model_id.to_string(),
                    message: "preparation task dropped".to_string(),
                });
            }
        }
    }

    /// Compose a caller-provided signal with the store's own shutdown
    /// controller, so [`Self::dispose`] can abort every in-flight
    /// preparation regardless of what signal the caller passed in.
    fn with_shutdown(&self, signal: CancellationToken) -> CancellationToken {
        let combined = self.shutdown.child_token();
        let child = combined.clone();
        tokio::spawn(async move {
            signal.cancelled().await;
            child.cancel();
        });
        combined
    }

    async fn run_prepare(
        &self,
        model_id: &str,
        signal: CancellationToken,
        tx: watch::Sender<Option<PrepareResult>>,
    ) {
        let _permit = self.prepare_semaphore.acquire().await;
        {
            let mut models = self.models.write().await;
            if let Some(model) = models.get_mut(model_id) {
                model.status = ModelStatus::Preparing;
            }
        }

        let (engine_name, config) = {
            let models = self.models.read().await;
            let model = models.get(model_id).expect("checked above");
            (model.config.engine.clone(), model.config.clone())
        };
        let engine = self.engines.get(&engine_name).cloned();

        let result = if let Some(engine) = engine {
            let ctx = PrepareCtx {
                model_id: model_id.to_string(),
                config: config.defaults.clone(),
            };
            let progress_model_id = model_id.to_string();
            let progress_store = Arc::clone(&self.progress);
            let on_progress: crate::engine::ProgressFn = Arc::new(move |event| {
                tracing::trace!(
                    model_id = %progress_model_id,
                    file = %event.file,
                    loaded_bytes = event.loaded_bytes,
                    total_bytes = event.total_bytes,
                    "prepare progress"
                );
                progress_store
                    .lock()
                    .entry(progress_model_id.clone())
                    .or_default()
                    .record(event.loaded_bytes, event.total_bytes);
            });
            engine
                .prepare_model(ctx, on_progress, signal)
                .await
                .map(Some)
                .map_err(|e| e.to_string())
        } else {
            Ok(None)
        };

        let mut models = self.models.write().await;
        let model = models.get_mut(model_id).expect("checked above");
        match &result {
            Ok(meta) => {
                model.status = ModelStatus::Ready;
                model.meta = meta.clone();
                model.error = None;
            }
            Err(message) => {
                model.status = ModelStatus::Error;
                model.error = Some(message.clone());
            }
        }
        drop(models);

        let _ = tx.send(Some(result.map(|_| ())));
    }

    pub async fn get_status(&self) -> StoreStatus {
        let models = self.models.read().await;
        let progress = self.progress.lock();
        models
            .iter()
            .map(|(id, model)| {
                let (percent, speed, eta) = progress
                    .get(id)
                    .map(DownloadProgress::snapshot)
                    .unwrap_or((None, None, None));
                (
                    id.clone(),
                    StoreStatusEntry {
                        status: model.status,
                        error: model.error.clone(),
                        percent,
                        speed_bytes_per_sec: speed,
                        eta_secs: eta,
                    },
                )
            })
            .collect()
    }

    pub async fn status_of(&self, model_id: &str) -> Option<ModelStatus> {
        self.models.read().await.get(model_id).map(|m| m.status)
    }

    pub async fn config_of(&self, model_id: &str) -> Option<ModelConfig> {
        self.models.read().await.get(model_id).map(|m| m.config.clone())
    }

    pub async fn all_configs(&self) -> Vec<ModelConfig> {
        self.models.read().await.values().map(|m| m.config.clone()).collect()
    }

    /// Abort all in-flight preparations.
    pub fn dispose(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
