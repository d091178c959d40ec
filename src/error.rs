//! Crate-wide error kinds (spec.md §7).

use thiserror::Error;

use crate::engine::EngineError;

/// Errors surfaced by the instance pool and its collaborators.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Unknown engine, invalid model id, or missing required source. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Request names a model whose status is `preparing` or `error`.
    #[error("model not ready: {model_id} ({status})")]
    ModelNotReady { model_id: String, status: String },

    /// Request names an unknown model.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Engine failed `createInstance`; the instance slot is reclaimed.
    #[error("instance load failed for model {model_id}: {message}")]
    InstanceLoadError { model_id: String, message: String },

    /// Engine raised during a task; the instance is disposed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Caller aborted before an instance was locked.
    #[error("request cancelled")]
    Cancelled,

    /// Per-task deadline elapsed. The caller still receives a partial result;
    /// this variant is for callers that asked for a deadline at selection time.
    #[error("request timed out")]
    Timeout,

    /// Lock on a non-idle instance, double release, or similar programmer error.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl PoolError {
    /// Stable short tag for metrics labels, independent of the Display message.
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::Config(_) => "config",
            PoolError::ModelNotReady { .. } => "model_not_ready",
            PoolError::ModelNotFound(_) => "model_not_found",
            PoolError::InstanceLoadError { .. } => "instance_load_error",
            PoolError::Engine(_) => "engine_error",
            PoolError::Cancelled => "cancelled",
            PoolError::Timeout => "timeout",
            PoolError::IllegalState(_) => "illegal_state",
        }
    }
}
