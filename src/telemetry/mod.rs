// Copyright 2024-2026 muster-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Structured logging, request spans, and metrics for the instance pool.
//!
//! All output is local (log sink + in-process metrics store); there is no
//! network exporter here, matching the rest of the crate's offline posture.

pub mod buckets;
mod logging;
mod metrics;
mod spans;
mod store;

pub use buckets::{BucketedHistogram, BucketedHistogramSnapshot};
pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    init_metrics, record_admission_rejection, record_context_cache_hit, record_instance_evicted,
    record_instance_spawned, record_selection_step, record_task_failure, record_task_success,
    record_waiter_queue_depth,
};
pub use spans::{RequestSpan, SpanExt};
pub use store::{HistogramSummary, MetricsSnapshot, MetricsStore};
