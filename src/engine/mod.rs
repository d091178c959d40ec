//! Engine Adapter interface (spec.md §6). The pool depends only on this
//! narrow trait; concrete backends (GGUF loading, ONNX, stable-diffusion
//! bindings, ...) are out of scope and live outside this crate.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors an engine adapter can raise. Wrapped by [`crate::error::PoolError::Engine`].
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("model preparation failed: {0}")]
    PrepareFailed(String),
    #[error("instance creation failed: {0}")]
    CreateFailed(String),
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("task kind not supported by this engine")]
    Unsupported,
}

/// Opaque engine-specific handle for a loaded instance. The core never
/// inspects its contents; engines downcast via [`EngineHandle::downcast_ref`]
/// if they need their own concrete type back.
#[derive(Clone)]
pub struct EngineHandle(Arc<dyn Any + Send + Sync>);

impl EngineHandle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EngineHandle(..)")
    }
}

/// Progress callback for model preparation (download/verification).
pub type ProgressFn = Arc<dyn Fn(DownloadProgressEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DownloadProgressEvent {
    pub file: String,
    pub loaded_bytes: u64,
    pub total_bytes: u64,
}

/// Context passed to `prepareModel`.
#[derive(Clone)]
pub struct PrepareCtx {
    pub model_id: String,
    pub config: serde_json::Value,
}

/// Context passed to `createInstance`.
#[derive(Clone)]
pub struct CreateCtx {
    pub model_id: String,
    pub gpu: bool,
    pub config: serde_json::Value,
}

/// Engine-reported metadata about a prepared model (e.g. parsed file header).
pub type ModelMeta = serde_json::Value;

/// A chat message role, normalized for hashing and engine dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Finish-reason as produced by an engine, before any HTTP-layer remapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    MaxTokens,
    ToolCalls,
    EogToken,
    StopTrigger,
    Timeout,
    Cancel,
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct TaskConfig {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Per-task options common to every `process*Task` call.
#[derive(Clone)]
pub struct TaskOptions {
    pub config: TaskConfig,
    pub on_chunk: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub reset_context: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            config: TaskConfig::default(),
            on_chunk: None,
            reset_context: false,
        }
    }
}

#[derive(Clone)]
pub struct ChatArgs {
    pub messages: Vec<ChatMessage>,
    pub opts: TaskOptions,
}

#[derive(Debug, Clone)]
pub struct ChatResult {
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
}

#[derive(Clone)]
pub struct TextCompletionArgs {
    pub prompt: String,
    pub opts: TaskOptions,
}

#[derive(Debug, Clone)]
pub struct TextCompletionResult {
    pub text: String,
    pub finish_reason: FinishReason,
}

#[derive(Clone)]
pub struct EmbeddingArgs {
    pub input: Vec<String>,
    pub opts: TaskOptions,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Clone)]
pub struct ImageToTextArgs {
    pub image_bytes: Arc<[u8]>,
    pub opts: TaskOptions,
}

#[derive(Debug, Clone)]
pub struct ImageToTextResult {
    pub text: String,
}

#[derive(Clone)]
pub struct SpeechToTextArgs {
    pub audio_bytes: Arc<[u8]>,
    pub opts: TaskOptions,
}

#[derive(Debug, Clone)]
pub struct SpeechToTextResult {
    pub text: String,
}

#[derive(Clone)]
pub struct TextToImageArgs {
    pub prompt: String,
    pub opts: TaskOptions,
}

#[derive(Debug, Clone)]
pub struct TextToImageResult {
    pub image_bytes: Arc<[u8]>,
}

/// Back-references handed to an engine that asked for them via `start`.
/// Passed explicitly rather than stashed in a global (spec.md §9 "Cyclic references").
#[derive(Clone)]
pub struct EngineBackrefs {
    pub pool: std::sync::Weak<crate::pool::Pool>,
    pub store: std::sync::Weak<crate::store::ModelStore>,
}

/// The narrow capability surface the core drives each inference backend
/// through. Unsupported task kinds default to `EngineError::Unsupported`
/// rather than forcing every adapter to implement all six.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this engine chooses its own device placement for `"auto"`.
    fn auto_gpu(&self) -> bool {
        false
    }

    async fn prepare_model(
        &self,
        _ctx: PrepareCtx,
        _on_progress: ProgressFn,
        _signal: CancellationToken,
    ) -> Result<ModelMeta, EngineError> {
        Ok(serde_json::Value::Null)
    }

    async fn create_instance(
        &self,
        ctx: CreateCtx,
        signal: CancellationToken,
    ) -> Result<EngineHandle, EngineError>;

    async fn dispose_instance(&self, handle: EngineHandle);

    async fn process_chat_completion_task(
        &self,
        _args: ChatArgs,
        _handle: &EngineHandle,
        _signal: CancellationToken,
    ) -> Result<ChatResult, EngineError> {
        Err(EngineError::Unsupported)
    }

    async fn process_text_completion_task(
        &self,
        _args: TextCompletionArgs,
        _handle: &EngineHandle,
        _signal: CancellationToken,
    ) -> Result<TextCompletionResult, EngineError> {
        Err(EngineError::Unsupported)
    }

    async fn process_embedding_task(
        &self,
        _args: EmbeddingArgs,
        _handle: &EngineHandle,
        _signal: CancellationToken,
    ) -> Result<EmbeddingResult, EngineError> {
        Err(EngineError::Unsupported)
    }

    async fn process_image_to_text_task(
        &self,
        _args: ImageToTextArgs,
        _handle: &EngineHandle,
        _signal: CancellationToken,
    ) -> Result<ImageToTextResult, EngineError> {
        Err(EngineError::Unsupported)
    }

    async fn process_speech_to_text_task(
        &self,
        _args: SpeechToTextArgs,
        _handle: &EngineHandle,
        _signal: CancellationToken,
    ) -> Result<SpeechToTextResult, EngineError> {
        Err(EngineError::Unsupported)
    }

    async fn process_text_to_image_task(
        &self,
        _args: TextToImageArgs,
        _handle: &EngineHandle,
        _signal: CancellationToken,
    ) -> Result<TextToImageResult, EngineError> {
        Err(EngineError::Unsupported)
    }

    /// Called once at registry build time for engines that need back-references.
    fn start(&self, _refs: EngineBackrefs) {}
}
