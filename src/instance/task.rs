//! Task handle: the opaque result object for an in-progress inference
//! (spec.md §4.2, GLOSSARY "Task handle").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::FinishReason;
use crate::error::PoolError;

/// Per-call overrides composed into the effective cancellation signal
/// (spec.md §4.2 "Timeout/cancel"): the caller's own signal plus an optional
/// per-task timeout. The task handle's own `cancel()` is a third source,
/// composed internally by [`super::Instance`].
#[derive(Default, Clone)]
pub struct TaskOptionsOverride {
    pub caller_signal: Option<CancellationToken>,
    pub timeout: Option<Duration>,
}

/// Opaque task handle: stable `id`, `model`, `created_at`, `cancel()`, and a
/// future `result`.
pub struct TaskHandle<T> {
    pub id: Uuid,
    pub model: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    cancel_token: CancellationToken,
    join: tokio::task::JoinHandle<Result<T, PoolError>>,
    timed_out: Arc<AtomicBool>,
}

impl<T> TaskHandle<T> {
    pub(super) fn new(
        model: String,
        cancel_token: CancellationToken,
        join: tokio::task::JoinHandle<Result<T, PoolError>>,
        timed_out: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model,
            created_at: chrono::Utc::now(),
            cancel_token,
            join,
            timed_out,
        }
    }

    /// Explicit cancellation (third source composed into the effective signal).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Await the task's outcome, together with whether the per-task timeout
    /// (rather than the engine itself, or an explicit `cancel()`) is what
    /// ended it. On timeout, the engine's partial result is still returned;
    /// the caller must overwrite `finishReason` to `timeout` using the
    /// returned flag (spec.md §4.2), which can only be known once the task
    /// has actually resolved.
    pub async fn result(self) -> (Result<T, PoolError>, bool) {
        let result = match self.join.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_cancelled() => Err(PoolError::Cancelled),
            Err(join_err) => Err(PoolError::IllegalState(format!("task panicked: {join_err}"))),
        };
        (result, self.timed_out.load(Ordering::SeqCst))
    }
}

/// Overwrite a result's finish reason to `timeout`/`cancel`/`abort` per
/// spec.md §4.2. Called by the pool after awaiting a task handle.
pub fn overwrite_finish_reason_on_timeout(reason: FinishReason, timed_out: bool) -> FinishReason {
    if timed_out {
        FinishReason::Timeout
    } else {
        reason
    }
}
