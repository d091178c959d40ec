//! Pool/Scheduler: matches requests to instances, enforces global
//! concurrency and per-model capacity, spawns/evicts instances (spec.md §4.3).

pub mod selection;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::engine::{CreateCtx, EngineAdapter};
use crate::error::PoolError;
use crate::instance::{Instance, InstanceStatus};
use crate::store::{ModelStatus, ModelStore};
use crate::telemetry::{MetricsStore, RequestSpan, SpanExt};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    /// Whether a waiter whose request matches a just-released instance's
    /// context state may be served ahead of older waiters (spec.md §9 Open Question).
    pub promote_cache_hits: bool,
    pub ttl_sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            promote_cache_hits: true,
            ttl_sweep_interval: Duration::from_secs(10),
        }
    }
}

/// What the caller wants matched against live instances. The pool derives
/// GPU requirements and capacity bounds from the model's stored config.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub model: String,
    pub context_hash: Option<String>,
}

struct Waiter {
    sequence: u64,
    context_hash: Option<String>,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct PoolState {
    instances: HashMap<String, Instance>,
    waiters: HashMap<String, VecDeque<Waiter>>,
}

impl PoolState {
    fn live_count(&self, model_id: &str) -> usize {
        self.instances
            .values()
            .filter(|i| i.model_id == model_id && !matches!(i.status, InstanceStatus::Disposing))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub id: String,
    pub model_id: String,
    pub status: &'static str,
    pub gpu: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStatus {
    pub processing: usize,
    pub waiting: usize,
    pub instances: Vec<InstanceSnapshot>,
}

/// Turns a stream of requests into a valid interleaving of locked-instance
/// usages. Owns the instance map, per-model waiter queues, and the global
/// concurrency semaphore behind a single `tokio::sync::Mutex` guarding all
/// index mutation; engine calls always happen with the lock released.
pub struct Pool {
    config: PoolConfig,
    store: Arc<ModelStore>,
    engines: HashMap<String, Arc<dyn EngineAdapter>>,
    state: Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
    sequence: AtomicU64,
    shutting_down: AtomicBool,
    metrics: Arc<MetricsStore>,
}

/// Result of `requestInstance`: a locked instance id plus everything needed
/// to release it. Dropping without calling `release` still frees the
/// semaphore permit (RAII), but leaves the instance `busy` forever - callers
/// must call `release`.
pub struct PoolLock {
    pool: Arc<Pool>,
    pub instance_id: String,
    pub model: String,
    _permit: OwnedSemaphorePermit,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        store: Arc<ModelStore>,
        engines: HashMap<String, Arc<dyn EngineAdapter>>,
        metrics: Arc<MetricsStore>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            store,
            engines,
            state: Mutex::new(PoolState::default()),
            sequence: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            metrics,
        });
        Pool::spawn_ttl_sweep(Arc::clone(&pool));
        pool
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Blocks until a suitable instance is locked and charged against the
    /// global concurrency budget.
    pub async fn request_instance(
        self: &Arc<Self>,
        req: SelectionRequest,
        signal: CancellationToken,
    ) -> Result<PoolLock, PoolError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::Cancelled);
        }

        let status = self
            .store
            .status_of(&req.model)
            .await
            .ok_or_else(|| PoolError::ModelNotFound(req.model.clone()))?;
        if status != ModelStatus::Ready {
            return Err(PoolError::ModelNotReady {
                model_id: req.model.clone(),
                status: format!("{status:?}"),
            });
        }
        let model_config = self
            .store
            .config_of(&req.model)
            .await
            .expect("status checked Ready above");
        let engine = self
            .engines
            .get(&model_config.engine)
            .cloned()
            .ok_or_else(|| PoolError::Config(format!("unknown engine {}", model_config.engine)))?;

        let sequence = self.next_sequence();
        let span = RequestSpan::open(&req.model, sequence, "task");

        let this = Arc::clone(self);
        let span_handle = span.clone();
        let result = async move {
            loop {
                if signal.is_cancelled() {
                    this.metrics.incr_counter("pool_cancelled_before_lock", 1);
                    crate::telemetry::record_admission_rejection(&this.metrics, &req.model, "cancelled");
                    return Err(PoolError::Cancelled);
                }

                let outcome = {
                    let mut state = this.state.lock().await;
                    selection::select(
                        &mut state.instances,
                        &req.model,
                        model_config.requires_gpu(),
                        req.context_hash.as_deref(),
                        model_config.max_instances,
                    )
                };

                match outcome {
                    selection::Outcome::Ready(id, step) => {
                        let permit = tokio::select! {
                            biased;
                            _ = signal.cancelled() => {
                                crate::telemetry::record_admission_rejection(&this.metrics, &req.model, "cancelled");
                                return Err(PoolError::Cancelled);
                            }
                            permit = Arc::clone(&this.semaphore).acquire_owned() => {
                                permit.expect("semaphore never closed")
                            }
                        };

                        let mut state = this.state.lock().await;
                        if let Some(instance) = state.instances.get_mut(&id) {
                            if instance.status == InstanceStatus::Idle {
                                instance.lock_for(sequence)?;
                                drop(state);
                                span_handle.record_instance(&id);
                                crate::telemetry::record_selection_step(&this.metrics, &req.model, step);
                                if step == 1 {
                                    crate::telemetry::record_context_cache_hit(&this.metrics, &req.model);
                                }
                                return Ok(PoolLock {
                                    pool: Arc::clone(&this),
                                    instance_id: id,
                                    model: req.model.clone(),
                                    _permit: permit,
                                });
                            }
                        }
                        // Lost the race to another selector between choosing and
                        // acquiring the permit; drop it and retry from the top.
                        drop(permit);
                        continue;
                    }
                    selection::Outcome::Spawn => {
                        let _ = this.spawn_instance(&req.model, &model_config, &engine).await;
                        continue; // falls back to the selection loop, per spec.md §4.3
                    }
                    selection::Outcome::Wait => {
                        let (tx, rx) = oneshot::channel();
                        {
                            let mut state = this.state.lock().await;
                            state.waiters.entry(req.model.clone()).or_default().push_back(Waiter {
                                sequence,
                                context_hash: req.context_hash.clone(),
                                wake: tx,
                            });
                            let depth = state.waiters.get(&req.model).map(|q| q.len()).unwrap_or(0);
                            crate::telemetry::record_waiter_queue_depth(&this.metrics, &req.model, depth);
                        }

                        tokio::select! {
                            biased;
                            _ = signal.cancelled() => {
                                let mut state = this.state.lock().await;
                                if let Some(queue) = state.waiters.get_mut(&req.model) {
                                    queue.retain(|w| w.sequence != sequence);
                                }
                                crate::telemetry::record_admission_rejection(&this.metrics, &req.model, "cancelled");
                                return Err(PoolError::Cancelled);
                            }
                            _ = rx => {}
                        }
                        continue;
                    }
                }
            }
        }
        .in_request_span(&span)
        .await;

        result
    }

    async fn spawn_instance(
        &self,
        model_id: &str,
        config: &crate::store::ModelConfig,
        engine: &Arc<dyn EngineAdapter>,
    ) -> Result<(), PoolError> {
        let gpu = match config.requires_gpu() {
            Some(gpu) => gpu,
            None => engine.auto_gpu(),
        };
        let mut instance = Instance::new(model_id.to_string(), gpu, config_fingerprint(config));
        instance.status = InstanceStatus::Loading;
        let instance_id = instance.id.clone();

        // Reserve the slot immediately so concurrent requesters see it
        // counted toward maxInstances while the spawn is in flight.
        {
            let mut state = self.state.lock().await;
            state.instances.insert(instance_id.clone(), instance);
        }

        let ctx = CreateCtx {
            model_id: model_id.to_string(),
            gpu,
            config: config.defaults.clone(),
        };
        let result = engine.create_instance(ctx, CancellationToken::new()).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(handle) => {
                if let Some(instance) = state.instances.get_mut(&instance_id) {
                    instance.handle = Some(handle);
                    instance.status = InstanceStatus::Idle;
                }
                drop(state);
                crate::telemetry::record_instance_spawned(&self.metrics, model_id);
                self.wake_one_waiter(model_id, None).await;
                Ok(())
            }
            Err(e) => {
                state.instances.remove(&instance_id);
                drop(state);
                Err(PoolError::InstanceLoadError {
                    model_id: model_id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Wake a waiter for `model_id`: promote a context-cache match when
    /// `released_context_hash` is given and promotion is enabled, else wake
    /// the oldest waiter by `sequence`.
    async fn wake_one_waiter(&self, model_id: &str, released_context_hash: Option<&str>) {
        let mut state = self.state.lock().await;
        let Some(queue) = state.waiters.get_mut(model_id) else { return };
        if queue.is_empty() {
            return;
        }

        let promoted_idx = if self.config.promote_cache_hits {
            released_context_hash.and_then(|hash| {
                queue
                    .iter()
                    .position(|w| w.context_hash.as_deref() == Some(hash))
            })
        } else {
            None
        };

        let waiter = match promoted_idx {
            Some(idx) => queue.remove(idx).expect("valid index"),
            None => queue.pop_front().expect("checked non-empty above"),
        };
        let _ = waiter.wake.send(());
        let depth = queue.len();
        drop(state);
        crate::telemetry::record_waiter_queue_depth(&self.metrics, model_id, depth);
    }

    async fn release_instance(self: &Arc<Self>, instance_id: &str, model_id: &str) {
        let context_hash = {
            let mut state = self.state.lock().await;
            let context_hash = state
                .instances
                .get(instance_id)
                .and_then(|i| i.context_state_hash.clone());
            if let Some(instance) = state.instances.get_mut(instance_id) {
                instance.unlock();
            }
            context_hash
        };
        self.wake_one_waiter(model_id, context_hash.as_deref()).await;
    }

    /// Record the context hash an instance now holds after a successful
    /// chat task, per the "after a successful chat task..." invariant.
    pub async fn record_context_state(&self, instance_id: &str, hash: String) {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.context_state_hash = Some(hash);
            instance.needs_reset = false;
        }
    }

    /// Mark an instance `error` and drop it after an engine failure during a
    /// task; it is not reused (spec.md §4.3 "Failure semantics").
    pub async fn fail_instance(&self, instance_id: &str) {
        let (handle, model_id) = {
            let mut state = self.state.lock().await;
            let Some(instance) = state.instances.remove(instance_id) else { return };
            (instance.handle, instance.model_id)
        };
        let Some(handle) = handle else { return };
        let Some(config) = self.store.config_of(&model_id).await else { return };
        if let Some(engine) = self.engines.get(&config.engine) {
            engine.dispose_instance(handle).await;
        }
        crate::telemetry::record_instance_evicted(&self.metrics, &model_id, "error");
        self.wake_one_waiter(&model_id, None).await;
    }

    /// Run `f` against the locked instance behind a `PoolLock`. Fails if the
    /// instance has since been removed (e.g. raced with a shutdown sweep).
    pub async fn with_instance<R>(&self, instance_id: &str, f: impl FnOnce(&Instance) -> R) -> Result<R, PoolError> {
        let state = self.state.lock().await;
        let instance = state
            .instances
            .get(instance_id)
            .ok_or_else(|| PoolError::IllegalState(format!("instance {instance_id} not found")))?;
        Ok(f(instance))
    }

    pub async fn get_status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let instances = state
            .instances
            .values()
            .map(|i| InstanceSnapshot {
                id: i.id.clone(),
                model_id: i.model_id.clone(),
                status: status_label(i.status),
                gpu: i.gpu,
                created_at: i.created_at_utc,
            })
            .collect();
        let processing = state
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Busy)
            .count();
        let waiting = state.waiters.values().map(|q| q.len()).sum();
        PoolStatus { processing, waiting, instances }
    }

    /// Mark shutting down; future requests fail fast; disposes every
    /// currently idle/loading instance. Busy instances are disposed as they
    /// are released (see `release_instance`).
    pub async fn dispose(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let to_dispose: Vec<(String, crate::engine::EngineHandle)> = {
            let mut state = self.state.lock().await;
            let ids: Vec<String> = state
                .instances
                .iter()
                .filter(|(_, i)| i.status != InstanceStatus::Busy)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let instance = state.instances.remove(&id)?;
                    instance.handle.map(|h| (instance.model_id, h))
                })
                .collect()
        };
        for (model_id, handle) in to_dispose {
            if let Some(config) = self.store.config_of(&model_id).await {
                if let Some(engine) = self.engines.get(&config.engine) {
                    engine.dispose_instance(handle).await;
                }
            }
        }
    }

    fn spawn_ttl_sweep(pool: Arc<Pool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.ttl_sweep_interval);
            loop {
                ticker.tick().await;
                if pool.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                pool.sweep_ttl().await;
            }
        });
    }

    async fn sweep_ttl(&self) {
        let configs = self.store.all_configs().await;
        let now = Instant::now();
        let mut to_evict: Vec<(String, crate::engine::EngineHandle, String)> = Vec::new();

        {
            let mut state = self.state.lock().await;
            for config in &configs {
                let live = state.live_count(&config.id);
                if live <= config.min_instances as usize {
                    continue;
                }
                let ttl = config.ttl();
                let stale_ids: Vec<String> = state
                    .instances
                    .values()
                    .filter(|i| {
                        i.model_id == config.id
                            && i.status == InstanceStatus::Idle
                            && now.duration_since(i.last_used_at) > ttl
                    })
                    .map(|i| i.id.clone())
                    .collect();
                for id in stale_ids {
                    if state.live_count(&config.id) <= config.min_instances as usize {
                        break;
                    }
                    if let Some(mut instance) = state.instances.remove(&id) {
                        instance.status = InstanceStatus::Disposing;
                        if let Some(handle) = instance.handle.take() {
                            to_evict.push((config.id.clone(), handle, config.engine.clone()));
                        }
                    }
                }
            }
        }

        for (model_id, handle, engine_name) in to_evict {
            if let Some(engine) = self.engines.get(&engine_name) {
                engine.dispose_instance(handle).await;
            }
            crate::telemetry::record_instance_evicted(&self.metrics, &model_id, "ttl");
        }
    }
}

impl PoolLock {
    /// Release the locked instance back to the pool; may dispatch a waiting
    /// request or be picked up by the next TTL sweep.
    pub async fn release(self) {
        self.pool.release_instance(&self.instance_id, &self.model).await;
    }
}

fn status_label(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Preparing => "preparing",
        InstanceStatus::Loading => "loading",
        InstanceStatus::Idle => "idle",
        InstanceStatus::Busy => "busy",
        InstanceStatus::Error => "error",
        InstanceStatus::Disposing => "disposing",
    }
}

fn config_fingerprint(config: &crate::store::ModelConfig) -> String {
    crate::instance::hash_canonical(&format!("{}:{:?}:{}", config.id, config.task, config.engine))
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
