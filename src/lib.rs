//! muster-core: an instance pool and scheduler for a local inference server.
//!
//! Multiplexes chat, text-completion, embedding, image-to-text,
//! speech-to-text, and text-to-image requests over a bounded set of
//! long-lived model instances, each backed by a pluggable [`engine::EngineAdapter`].
//!
//! # Design Principles
//!
//! - **Narrow adapter surface**: the pool depends only on [`engine::EngineAdapter`];
//!   concrete backends (GGUF, ONNX, diffusion bindings, ...) live outside this crate.
//! - **Single scheduler lock**: all instance/waiter bookkeeping is serialized
//!   behind one lock; engine calls always happen with it released.
//! - **Context-aware scheduling**: a non-cryptographic hash of the
//!   conversational prefix lets the scheduler prefer an instance whose KV
//!   cache already holds it, avoiding a redundant prefill.

pub mod config;
pub mod engine;
pub mod error;
pub mod instance;
pub mod pool;
pub mod runtime;
pub mod store;
pub mod telemetry;

/// In-process `EngineAdapter` test double, shared by this crate's own unit
/// tests and by integration tests under `tests/`. Not part of the crate's
/// stability guarantees.
#[doc(hidden)]
pub mod test_support;

pub use config::Config;
pub use error::PoolError;
pub use runtime::Runtime;
