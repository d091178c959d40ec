//! In-process engine adapter test double, shared by unit and integration
//! tests across `instance`, `pool`, and `store`. Deterministic, latency- and
//! failure-scriptable, and instruments "is the engine executing right now"
//! for the concurrency-cap scenario (spec.md §8 scenario 3).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::*;

pub struct FakeEngineAdapter {
    name: String,
    latency: Duration,
    fail_create: bool,
    create_calls: AtomicU64,
    concurrently_executing: Arc<AtomicU32>,
    max_observed_concurrency: Arc<AtomicU32>,
    last_messages: Mutex<Option<Vec<ChatMessage>>>,
    prepare_progress: Vec<(u64, u64)>,
}

impl FakeEngineAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latency: Duration::from_millis(1),
            fail_create: false,
            create_calls: AtomicU64::new(0),
            concurrently_executing: Arc::new(AtomicU32::new(0)),
            max_observed_concurrency: Arc::new(AtomicU32::new(0)),
            last_messages: Mutex::new(None),
            prepare_progress: Vec::new(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Replays `(loaded_bytes, total_bytes)` pairs through `onProgress` during
    /// `prepareModel`, for exercising the Store's per-file progress tracker.
    pub fn with_prepare_progress(mut self, events: Vec<(u64, u64)>) -> Self {
        self.prepare_progress = events;
        self
    }

    pub fn create_call_count(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn max_observed_concurrency(&self) -> u32 {
        self.max_observed_concurrency.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineAdapter for FakeEngineAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare_model(
        &self,
        _ctx: PrepareCtx,
        on_progress: ProgressFn,
        _signal: CancellationToken,
    ) -> Result<ModelMeta, EngineError> {
        for &(loaded_bytes, total_bytes) in &self.prepare_progress {
            on_progress(DownloadProgressEvent {
                file: "model.bin".to_string(),
                loaded_bytes,
                total_bytes,
            });
        }
        Ok(serde_json::Value::Null)
    }

    async fn create_instance(
        &self,
        ctx: CreateCtx,
        _signal: CancellationToken,
    ) -> Result<EngineHandle, EngineError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(EngineError::CreateFailed(format!(
                "fake engine configured to fail create_instance for {}",
                ctx.model_id
            )));
        }
        Ok(EngineHandle::new(ctx.model_id))
    }

    async fn dispose_instance(&self, _handle: EngineHandle) {}

    async fn process_chat_completion_task(
        &self,
        args: ChatArgs,
        _handle: &EngineHandle,
        signal: CancellationToken,
    ) -> Result<ChatResult, EngineError> {
        let concurrency = self.concurrently_executing.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed_concurrency.fetch_max(concurrency, Ordering::SeqCst);

        let finish_reason = tokio::select! {
            _ = tokio::time::sleep(self.latency) => FinishReason::EogToken,
            _ = signal.cancelled() => FinishReason::Cancel,
        };

        self.concurrently_executing.fetch_sub(1, Ordering::SeqCst);

        let last_user = args
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        *self.last_messages.lock() = Some(args.messages.clone());

        Ok(ChatResult {
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: format!("echo: {last_user}"),
            },
            finish_reason,
        })
    }

    async fn process_text_completion_task(
        &self,
        args: TextCompletionArgs,
        _handle: &EngineHandle,
        signal: CancellationToken,
    ) -> Result<TextCompletionResult, EngineError> {
        let finish_reason = tokio::select! {
            _ = tokio::time::sleep(self.latency) => FinishReason::EogToken,
            _ = signal.cancelled() => FinishReason::Cancel,
        };
        Ok(TextCompletionResult {
            text: format!("{}...continued", args.prompt),
            finish_reason,
        })
    }

    async fn process_embedding_task(
        &self,
        args: EmbeddingArgs,
        _handle: &EngineHandle,
        _signal: CancellationToken,
    ) -> Result<EmbeddingResult, EngineError> {
        Ok(EmbeddingResult {
            vectors: args.input.iter().map(|s| vec![s.len() as f32]).collect(),
        })
    }
}
