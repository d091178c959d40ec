// Copyright 2024-2026 muster-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Metrics recording for the instance pool. Every call records through the
//! `metrics` facade (for whatever external exporter a deployment installs)
//! *and* into the in-process [`super::MetricsStore`] that backs
//! `Runtime::metrics_snapshot` - no external exporter is wired up inside
//! this crate, so the facade alone would otherwise be silently discarded by
//! its default no-op recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use super::MetricsStore;

/// Register metric descriptions. Call once at startup.
pub fn init_metrics() {
    describe_counter!("pool_requests_total", "Total requests submitted to the pool");
    describe_counter!("pool_requests_succeeded", "Requests that completed successfully");
    describe_counter!("pool_requests_failed", "Requests that failed during execution");
    describe_counter!("pool_admission_rejections_total", "Requests cancelled while waiting");
    describe_counter!("pool_instances_spawned_total", "Instances created");
    describe_counter!("pool_instances_evicted_total", "Instances disposed by TTL or shutdown");
    describe_counter!("pool_context_cache_hits_total", "Requests served by a context-cache hit");
    describe_gauge!("pool_waiter_queue_depth", "Current waiter queue depth for a model");
    describe_histogram!("pool_selection_step", "Which selection step satisfied a request (1-5)");
    describe_histogram!("pool_task_latency_ms", "Task latency in milliseconds");
}

fn labeled(name: &str, model: &str) -> String {
    format!("{name}{{model=\"{model}\"}}")
}

/// Record that a request was rejected before an instance was locked
/// (cancelled while waiting, or pool shutting down).
pub fn record_admission_rejection(store: &MetricsStore, model: &str, reason: &str) {
    counter!("pool_requests_total", "model" => model.to_string()).increment(1);
    counter!(
        "pool_admission_rejections_total",
        "model" => model.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
    store.incr_counter(&labeled("pool_requests_total", model), 1);
    store.incr_counter(&labeled("pool_admission_rejections_total", model), 1);
}

/// Record a successfully completed task.
pub fn record_task_success(store: &MetricsStore, model: &str, latency_ms: u64) {
    counter!("pool_requests_total", "model" => model.to_string()).increment(1);
    counter!("pool_requests_succeeded", "model" => model.to_string()).increment(1);
    histogram!("pool_task_latency_ms", "model" => model.to_string()).record(latency_ms as f64);
    store.incr_counter(&labeled("pool_requests_total", model), 1);
    store.incr_counter(&labeled("pool_requests_succeeded", model), 1);
    store.observe_histogram(&labeled("pool_task_latency_ms", model), latency_ms as f64);
}

/// Record a task that failed during execution (engine error, not admission).
pub fn record_task_failure(store: &MetricsStore, model: &str, error_kind: &str) {
    counter!("pool_requests_total", "model" => model.to_string()).increment(1);
    counter!(
        "pool_requests_failed",
        "model" => model.to_string(),
        "kind" => error_kind.to_string()
    )
    .increment(1);
    store.incr_counter(&labeled("pool_requests_total", model), 1);
    store.incr_counter(&labeled("pool_requests_failed", model), 1);
}

/// Record an instance spawn for a model.
pub fn record_instance_spawned(store: &MetricsStore, model: &str) {
    counter!("pool_instances_spawned_total", "model" => model.to_string()).increment(1);
    store.incr_counter(&labeled("pool_instances_spawned_total", model), 1);
}

/// Record an instance eviction (TTL sweep or shutdown) for a model.
pub fn record_instance_evicted(store: &MetricsStore, model: &str, reason: &str) {
    counter!(
        "pool_instances_evicted_total",
        "model" => model.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
    store.incr_counter(&labeled("pool_instances_evicted_total", model), 1);
}

/// Record a context-cache hit (selection step 1 satisfied the request).
pub fn record_context_cache_hit(store: &MetricsStore, model: &str) {
    counter!("pool_context_cache_hits_total", "model" => model.to_string()).increment(1);
    store.incr_counter(&labeled("pool_context_cache_hits_total", model), 1);
}

/// Record the current waiter-queue depth for a model.
pub fn record_waiter_queue_depth(store: &MetricsStore, model: &str, depth: usize) {
    gauge!("pool_waiter_queue_depth", "model" => model.to_string()).set(depth as f64);
    store.set_gauge(&labeled("pool_waiter_queue_depth", model), depth as f64);
}

/// Record which of the five selection steps (spec.md §4.3) satisfied a request.
pub fn record_selection_step(store: &MetricsStore, model: &str, step: u8) {
    histogram!("pool_selection_step", "model" => model.to_string()).record(step as f64);
    store.observe_histogram(&labeled("pool_selection_step", model), step as f64);
}
