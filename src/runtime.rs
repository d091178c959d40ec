//! Runtime: the façade wiring [`Config`], the [`ModelStore`], and the
//! [`Pool`] into the six task-submission entry points (spec.md §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::{
    ChatArgs, ChatResult, EmbeddingArgs, EmbeddingResult, EngineAdapter, EngineBackrefs,
    ImageToTextArgs, ImageToTextResult, SpeechToTextArgs, SpeechToTextResult, TextCompletionArgs,
    TextCompletionResult, TextToImageArgs, TextToImageResult,
};
use crate::error::PoolError;
use crate::instance::{canonical_chat_prefix, canonical_full_chat, canonical_text_prefix, hash_canonical, TaskOptionsOverride};
use crate::pool::{Pool, PoolConfig, SelectionRequest};
use crate::store::{ModelStore, StoreStatus};
use crate::telemetry::{self, MetricsSnapshot, MetricsStore};

/// Top-level handle to a running instance pool. Cloneable via `Arc`; every
/// `submit_*` call blocks until an instance is locked, then runs the task.
pub struct Runtime {
    config: Config,
    store: Arc<ModelStore>,
    pool: Arc<Pool>,
    engines: HashMap<String, Arc<dyn EngineAdapter>>,
    metrics: Arc<MetricsStore>,
}

impl Runtime {
    /// Validates every model's engine reference up front; construction fails
    /// closed rather than deferring to the first request (spec.md §7 "Config").
    pub fn new(config: Config, engines: HashMap<String, Arc<dyn EngineAdapter>>) -> Result<Arc<Self>, PoolError> {
        let model_configs: Vec<_> = config.models.values().cloned().collect();
        let store = Arc::new(ModelStore::new(model_configs, engines.clone(), config.prepare_concurrency)?);
        let metrics = Arc::new(MetricsStore::new());
        let pool_config = PoolConfig {
            concurrency: config.concurrency,
            ..PoolConfig::default()
        };
        let pool = Pool::new(pool_config, Arc::clone(&store), engines.clone(), Arc::clone(&metrics));

        let refs = EngineBackrefs {
            pool: Arc::downgrade(&pool),
            store: Arc::downgrade(&store),
        };
        for engine in engines.values() {
            engine.start(refs.clone());
        }

        Ok(Arc::new(Self { config, store, pool, engines, metrics }))
    }

    /// Install the global `tracing` subscriber and metric descriptions, and
    /// resolve every blocking/eagerly-warmed model (spec.md §4.1 "init").
    ///
    /// A subscriber can only be installed once per process; a second
    /// `Runtime` failing to grab it is not fatal, so that failure is logged
    /// and swallowed rather than aborting model preparation.
    pub async fn init(&self) -> Result<(), PoolError> {
        if let Err(e) = telemetry::init_logging(&self.config.log) {
            tracing::debug!(error = %e, "tracing subscriber not installed (already set?)");
        }
        telemetry::init_metrics();
        self.store.init().await
    }

    pub async fn store_status(&self) -> StoreStatus {
        self.store.get_status().await
    }

    pub async fn pool_status(&self) -> crate::pool::PoolStatus {
        self.pool.get_status().await
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn engine_for(&self, model_id: &str, engine_name: &str) -> Result<Arc<dyn EngineAdapter>, PoolError> {
        self.engines
            .get(engine_name)
            .cloned()
            .ok_or_else(|| PoolError::Config(format!("model {model_id} references unknown engine {engine_name}")))
    }

    pub async fn submit_chat_completion(
        &self,
        model: &str,
        args: ChatArgs,
        overrides: TaskOptionsOverride,
    ) -> Result<ChatResult, PoolError> {
        let context_hash = hash_canonical(&canonical_chat_prefix(&args.messages));
        let config = self.store.config_of(model).await.ok_or_else(|| PoolError::ModelNotFound(model.to_string()))?;
        let engine = self.engine_for(model, &config.engine)?;
        let signal = overrides.caller_signal.clone().unwrap_or_else(CancellationToken::new);

        let lock = self
            .pool
            .request_instance(SelectionRequest { model: model.to_string(), context_hash: Some(context_hash) }, signal)
            .await?;

        let started = Instant::now();
        let handle = self
            .pool
            .with_instance(&lock.instance_id, |instance| {
                instance.process_chat_completion_task(Arc::clone(&engine), args.clone(), overrides)
            })
            .await?;

        match handle.result().await {
            (Ok(mut result), timed_out) => {
                result.finish_reason = crate::instance::overwrite_finish_reason_on_timeout(result.finish_reason, timed_out);
                let mut full = args.messages;
                full.push(result.message.clone());
                let new_hash = hash_canonical(&canonical_full_chat(&full));
                self.pool.record_context_state(&lock.instance_id, new_hash).await;
                lock.release().await;
                telemetry::record_task_success(&self.metrics, model, started.elapsed().as_millis() as u64);
                Ok(result)
            }
            (Err(e), _) => {
                self.pool.fail_instance(&lock.instance_id).await;
                telemetry::record_task_failure(&self.metrics, model, e.kind());
                Err(e)
            }
        }
    }

    pub async fn submit_text_completion(
        &self,
        model: &str,
        args: TextCompletionArgs,
        overrides: TaskOptionsOverride,
    ) -> Result<TextCompletionResult, PoolError> {
        let context_hash = hash_canonical(&canonical_text_prefix(&args.prompt));
        let config = self.store.config_of(model).await.ok_or_else(|| PoolError::ModelNotFound(model.to_string()))?;
        let engine = self.engine_for(model, &config.engine)?;
        let signal = overrides.caller_signal.clone().unwrap_or_else(CancellationToken::new);

        let lock = self
            .pool
            .request_instance(SelectionRequest { model: model.to_string(), context_hash: Some(context_hash) }, signal)
            .await?;

        let started = Instant::now();
        let handle = self
            .pool
            .with_instance(&lock.instance_id, |instance| {
                instance.process_text_completion_task(Arc::clone(&engine), args.clone(), overrides)
            })
            .await?;

        match handle.result().await {
            (Ok(mut result), timed_out) => {
                result.finish_reason = crate::instance::overwrite_finish_reason_on_timeout(result.finish_reason, timed_out);
                let new_hash = hash_canonical(&canonical_text_prefix(&format!("{}{}", args.prompt, result.text)));
                self.pool.record_context_state(&lock.instance_id, new_hash).await;
                lock.release().await;
                telemetry::record_task_success(&self.metrics, model, started.elapsed().as_millis() as u64);
                Ok(result)
            }
            (Err(e), _) => {
                self.pool.fail_instance(&lock.instance_id).await;
                telemetry::record_task_failure(&self.metrics, model, e.kind());
                Err(e)
            }
        }
    }

    /// Embedding, image-to-text, speech-to-text, and text-to-image tasks
    /// carry no conversational context to cache or record (spec.md §4.2), so
    /// their dispatch is identical up to which `process_*_task` is called.
    pub async fn submit_embedding(
        &self,
        model: &str,
        args: EmbeddingArgs,
        overrides: TaskOptionsOverride,
    ) -> Result<EmbeddingResult, PoolError> {
        let engine = self.lookup_engine(model).await?;
        let (lock, handle) = self
            .lock_and_dispatch(model, overrides, |instance, overrides| {
                instance.process_embedding_task(Arc::clone(&engine), args, overrides)
            })
            .await?;
        self.finish(model, lock, handle).await
    }

    pub async fn submit_image_to_text(
        &self,
        model: &str,
        args: ImageToTextArgs,
        overrides: TaskOptionsOverride,
    ) -> Result<ImageToTextResult, PoolError> {
        let engine = self.lookup_engine(model).await?;
        let (lock, handle) = self
            .lock_and_dispatch(model, overrides, |instance, overrides| {
                instance.process_image_to_text_task(Arc::clone(&engine), args, overrides)
            })
            .await?;
        self.finish(model, lock, handle).await
    }

    pub async fn submit_speech_to_text(
        &self,
        model: &str,
        args: SpeechToTextArgs,
        overrides: TaskOptionsOverride,
    ) -> Result<SpeechToTextResult, PoolError> {
        let engine = self.lookup_engine(model).await?;
        let (lock, handle) = self
            .lock_and_dispatch(model, overrides, |instance, overrides| {
                instance.process_speech_to_text_task(Arc::clone(&engine), args, overrides)
            })
            .await?;
        self.finish(model, lock, handle).await
    }

    pub async fn submit_text_to_image(
        &self,
        model: &str,
        args: TextToImageArgs,
        overrides: TaskOptionsOverride,
    ) -> Result<TextToImageResult, PoolError> {
        let engine = self.lookup_engine(model).await?;
        let (lock, handle) = self
            .lock_and_dispatch(model, overrides, |instance, overrides| {
                instance.process_text_to_image_task(Arc::clone(&engine), args, overrides)
            })
            .await?;
        self.finish(model, lock, handle).await
    }

    async fn lookup_engine(&self, model: &str) -> Result<Arc<dyn EngineAdapter>, PoolError> {
        let config = self
            .store
            .config_of(model)
            .await
            .ok_or_else(|| PoolError::ModelNotFound(model.to_string()))?;
        self.engine_for(model, &config.engine)
    }

    /// Acquire a locked instance with no context-cache key and hand it to
    /// `dispatch` to build the task handle.
    async fn lock_and_dispatch<R>(
        &self,
        model: &str,
        overrides: TaskOptionsOverride,
        dispatch: impl FnOnce(&crate::instance::Instance, TaskOptionsOverride) -> crate::instance::TaskHandle<R>,
    ) -> Result<(crate::pool::PoolLock, crate::instance::TaskHandle<R>), PoolError> {
        let signal = overrides.caller_signal.clone().unwrap_or_else(CancellationToken::new);
        let lock = self
            .pool
            .request_instance(SelectionRequest { model: model.to_string(), context_hash: None }, signal)
            .await?;
        let handle = self.pool.with_instance(&lock.instance_id, |instance| dispatch(instance, overrides)).await?;
        Ok((lock, handle))
    }

    async fn finish<R>(&self, model: &str, lock: crate::pool::PoolLock, handle: crate::instance::TaskHandle<R>) -> Result<R, PoolError> {
        let started = Instant::now();
        match handle.result().await {
            (Ok(result), _timed_out) => {
                // These task kinds carry no `finishReason` to remap on timeout
                // (spec.md §4.2).
                lock.release().await;
                telemetry::record_task_success(&self.metrics, model, started.elapsed().as_millis() as u64);
                Ok(result)
            }
            (Err(e), _) => {
                self.pool.fail_instance(&lock.instance_id).await;
                telemetry::record_task_failure(&self.metrics, model, e.kind());
                Err(e)
            }
        }
    }

    pub async fn shutdown(self: &Arc<Self>) {
        self.store.dispose();
        self.pool.dispose().await;
    }
}
