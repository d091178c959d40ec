//! Instance: a loaded model bound to an engine handle (spec.md §4.2).

mod context_hash;
mod task;

pub use context_hash::{canonical_chat_prefix, canonical_full_chat, canonical_text_prefix, hash_canonical};
pub use task::{TaskHandle, TaskOptionsOverride};

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{
    ChatArgs, ChatResult, EmbeddingArgs, EmbeddingResult, EngineAdapter, EngineHandle,
    ImageToTextArgs, ImageToTextResult, SpeechToTextArgs, SpeechToTextResult, TextCompletionArgs,
    TextCompletionResult, TextToImageArgs, TextToImageResult,
};
use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Preparing,
    Loading,
    Idle,
    Busy,
    Error,
    Disposing,
}

/// A loaded model instance. Mutated only by [`crate::pool::Pool`] under its
/// single scheduler lock; engine calls happen with the lock released.
pub struct Instance {
    pub id: String,
    pub model_id: String,
    pub gpu: bool,
    pub status: InstanceStatus,
    pub handle: Option<EngineHandle>,
    /// Monotonic clock values for TTL/LRU math.
    pub created_at: Instant,
    pub last_used_at: Instant,
    /// Wall-clock value for status reporting; not used for comparisons.
    pub created_at_utc: chrono::DateTime<chrono::Utc>,
    pub fingerprint: String,
    pub context_state_hash: Option<String>,
    pub needs_reset: bool,
    /// The requesting caller's sequence number while `busy`, spec.md §3's
    /// opaque `currentRequest` handle; `None` whenever the instance is not
    /// locked for a request.
    pub current_request: Option<u64>,
}

impl Instance {
    /// `id = modelId:<8-char nonce>` per spec.md §3.
    pub fn new(model_id: String, gpu: bool, fingerprint: String) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        let id = format!("{model_id}:{}", &nonce[..8]);
        let now = Instant::now();
        Self {
            id,
            model_id,
            gpu,
            status: InstanceStatus::Preparing,
            handle: None,
            created_at: now,
            last_used_at: now,
            created_at_utc: chrono::Utc::now(),
            fingerprint,
            context_state_hash: None,
            needs_reset: false,
            current_request: None,
        }
    }

    pub fn matches_requirements(&self, model_id: &str, require_gpu: Option<bool>) -> bool {
        if self.model_id != model_id {
            return false;
        }
        match require_gpu {
            Some(true) => self.gpu,
            Some(false) | None => true,
        }
    }

    /// True iff the instance's cached context exactly matches `candidate_hash`.
    pub fn matches_context_state(&self, candidate_hash: &str) -> bool {
        self.context_state_hash.as_deref() == Some(candidate_hash)
    }

    /// Mark the instance so the next task clears the engine's conversational state.
    pub fn reset(&mut self) {
        self.needs_reset = true;
        self.context_state_hash = None;
    }

    pub fn lock_for(&mut self, sequence: u64) -> Result<(), PoolError> {
        if self.status != InstanceStatus::Idle {
            return Err(PoolError::IllegalState(format!(
                "cannot lock instance {} in state {:?}",
                self.id, self.status
            )));
        }
        self.status = InstanceStatus::Busy;
        self.current_request = Some(sequence);
        Ok(())
    }

    pub fn unlock(&mut self) {
        self.last_used_at = Instant::now();
        self.status = InstanceStatus::Idle;
        self.current_request = None;
    }

    /// Compose the caller's signal and a per-task timeout into one effective
    /// token (spec.md §4.2 "Timeout/cancel"). The timeout timer is the sole
    /// owner of both jobs — cancelling `effective` and flipping the returned
    /// flag — so a task can never be cancelled by something else a moment
    /// before the timer fires and have the flag set regardless.
    fn effective_signal(
        caller_signal: Option<CancellationToken>,
        timeout: Option<std::time::Duration>,
        cancel_token: CancellationToken,
    ) -> (CancellationToken, std::sync::Arc<std::sync::atomic::AtomicBool>) {
        let effective = cancel_token.child_token();
        let timed_out_flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        if let Some(parent) = caller_signal {
            let child = effective.clone();
            tokio::spawn(async move {
                parent.cancelled().await;
                child.cancel();
            });
        }
        if let Some(duration) = timeout {
            let child = effective.clone();
            let flag = timed_out_flag.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {
                        flag.store(true, std::sync::atomic::Ordering::SeqCst);
                        child.cancel();
                    }
                }
            });
        }
        (effective, timed_out_flag)
    }

    pub fn process_chat_completion_task(
        &self,
        engine: std::sync::Arc<dyn EngineAdapter>,
        args: ChatArgs,
        overrides: TaskOptionsOverride,
    ) -> TaskHandle<ChatResult> {
        let handle = self.handle.clone().expect("busy instance has a handle");
        let model = self.model_id.clone();
        let cancel_token = CancellationToken::new();
        let (effective, timed_out_flag) =
            Self::effective_signal(overrides.caller_signal, overrides.timeout, cancel_token.clone());

        let join = tokio::spawn(async move {
            engine
                .process_chat_completion_task(args, &handle, effective)
                .await
                .map_err(PoolError::from)
        });

        TaskHandle::new(model, cancel_token, join, timed_out_flag)
    }

    pub fn process_text_completion_task(
        &self,
        engine: std::sync::Arc<dyn EngineAdapter>,
        args: TextCompletionArgs,
        overrides: TaskOptionsOverride,
    ) -> TaskHandle<TextCompletionResult> {
        let handle = self.handle.clone().expect("busy instance has a handle");
        let model = self.model_id.clone();
        let cancel_token = CancellationToken::new();
        let (effective, timed_out_flag) =
            Self::effective_signal(overrides.caller_signal, overrides.timeout, cancel_token.clone());
        let join = tokio::spawn(async move {
            engine
                .process_text_completion_task(args, &handle, effective)
                .await
                .map_err(PoolError::from)
        });
        TaskHandle::new(model, cancel_token, join, timed_out_flag)
    }

    pub fn process_embedding_task(
        &self,
        engine: std::sync::Arc<dyn EngineAdapter>,
        args: EmbeddingArgs,
        overrides: TaskOptionsOverride,
    ) -> TaskHandle<EmbeddingResult> {
        let handle = self.handle.clone().expect("busy instance has a handle");
        let model = self.model_id.clone();
        let cancel_token = CancellationToken::new();
        let (effective, timed_out_flag) =
            Self::effective_signal(overrides.caller_signal, overrides.timeout, cancel_token.clone());
        let join = tokio::spawn(async move {
            engine
                .process_embedding_task(args, &handle, effective)
                .await
                .map_err(PoolError::from)
        });
        TaskHandle::new(model, cancel_token, join, timed_out_flag)
    }

    pub fn process_image_to_text_task(
        &self,
        engine: std::sync::Arc<dyn EngineAdapter>,
        args: ImageToTextArgs,
        overrides: TaskOptionsOverride,
    ) -> TaskHandle<ImageToTextResult> {
        let handle = self.handle.clone().expect("busy instance has a handle");
        let model = self.model_id.clone();
        let cancel_token = CancellationToken::new();
        let (effective, timed_out_flag) =
            Self::effective_signal(overrides.caller_signal, overrides.timeout, cancel_token.clone());
        let join = tokio::spawn(async move {
            engine
                .process_image_to_text_task(args, &handle, effective)
                .await
                .map_err(PoolError::from)
        });
        TaskHandle::new(model, cancel_token, join, timed_out_flag)
    }

    pub fn process_speech_to_text_task(
        &self,
        engine: std::sync::Arc<dyn EngineAdapter>,
        args: SpeechToTextArgs,
        overrides: TaskOptionsOverride,
    ) -> TaskHandle<SpeechToTextResult> {
        let handle = self.handle.clone().expect("busy instance has a handle");
        let model = self.model_id.clone();
        let cancel_token = CancellationToken::new();
        let (effective, timed_out_flag) =
            Self::effective_signal(overrides.caller_signal, overrides.timeout, cancel_token.clone());
        let join = tokio::spawn(async move {
            engine
                .process_speech_to_text_task(args, &handle, effective)
                .await
                .map_err(PoolError::from)
        });
        TaskHandle::new(model, cancel_token, join, timed_out_flag)
    }

    pub fn process_text_to_image_task(
        &self,
        engine: std::sync::Arc<dyn EngineAdapter>,
        args: TextToImageArgs,
        overrides: TaskOptionsOverride,
    ) -> TaskHandle<TextToImageResult> {
        let handle = self.handle.clone().expect("busy instance has a handle");
        let model = self.model_id.clone();
        let cancel_token = CancellationToken::new();
        let (effective, timed_out_flag) =
            Self::effective_signal(overrides.caller_signal, overrides.timeout, cancel_token.clone());
        let join = tokio::spawn(async move {
            engine
                .process_text_to_image_task(args, &handle, effective)
                .await
                .map_err(PoolError::from)
        });
        TaskHandle::new(model, cancel_token, join, timed_out_flag)
    }
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;
