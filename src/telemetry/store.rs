// Copyright 2024-2026 muster-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-process snapshot of pool metrics, independent of whatever `metrics`
//! recorder backend (if any) is installed. Backs `Pool::getStatus()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Debug, Clone, Default)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
}

/// Sharded maps keyed by metric name; each entry is updated independently
/// so concurrent recorders for different metrics never contend.
#[derive(Default)]
pub struct MetricsStore {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicU64>, // f64 bits
    histograms: DashMap<String, HistogramSummary>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_counter(&self, name: &str, by: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn observe_histogram(&self, name: &str, value: f64) {
        let mut entry = self.histograms.entry(name.to_string()).or_default();
        entry.count += 1;
        entry.sum += value;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), f64::from_bits(e.value().load(Ordering::Relaxed))))
                .collect(),
            histograms: self.histograms.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let store = MetricsStore::new();
        store.incr_counter("x", 1);
        store.incr_counter("x", 2);
        assert_eq!(store.snapshot().counters["x"], 3);
    }

    #[test]
    fn histogram_tracks_count_and_sum() {
        let store = MetricsStore::new();
        store.observe_histogram("lat", 1.5);
        store.observe_histogram("lat", 2.5);
        let snap = store.snapshot();
        assert_eq!(snap.histograms["lat"].count, 2);
        assert!((snap.histograms["lat"].sum - 4.0).abs() < f64::EPSILON);
    }
}
