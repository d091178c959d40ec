//! Pure instance-selection throughput (spec.md §4.3 steps 1-5), independent
//! of any engine or tokio runtime.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use muster_core::engine::EngineHandle;
use muster_core::instance::Instance;
use muster_core::pool::selection::{select, Outcome};

fn idle_pool(model: &str, size: usize) -> HashMap<String, Instance> {
    let mut instances = HashMap::with_capacity(size);
    for i in 0..size {
        let mut instance = Instance::new(model.to_string(), false, "fp".to_string());
        instance.status = muster_core::instance::InstanceStatus::Idle;
        instance.handle = Some(EngineHandle::new(0u8));
        instance.last_used_at = Instant::now() - Duration::from_millis(i as u64);
        if i % 3 == 0 {
            instance.context_state_hash = Some(format!("hash-{i}"));
        }
        instances.insert(instance.id.clone(), instance);
    }
    instances
}

fn bench_select_cache_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_cache_hit");

    for size in [8usize, 64, 256] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("instances", size), &size, |b, &size| {
            b.iter_batched(
                || idle_pool("m", size),
                |mut instances| {
                    let outcome = select(black_box(&mut instances), "m", None, Some("hash-0"), size as u32);
                    matches!(outcome, Outcome::Ready(_, 1))
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_select_lru_reset(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_lru_reset");

    for size in [8usize, 64, 256] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("instances", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let mut instances = idle_pool("m", size);
                    for instance in instances.values_mut() {
                        instance.context_state_hash = Some("stale".to_string());
                    }
                    instances
                },
                // max_instances == size, so the model is already at cap and
                // step 4 (LRU-reset) is reached instead of step 3 (spawn).
                |mut instances| {
                    let outcome = select(black_box(&mut instances), "m", None, None, size as u32);
                    matches!(outcome, Outcome::Ready(_, 4))
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_select_spawn_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_spawn_decision");

    for size in [8usize, 64, 256] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("busy_instances", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let mut instances = idle_pool("m", size);
                    for instance in instances.values_mut() {
                        instance.status = muster_core::instance::InstanceStatus::Busy;
                    }
                    instances
                },
                |mut instances| select(black_box(&mut instances), "m", None, None, (size + 1) as u32),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_select_cache_hit,
    bench_select_lru_reset,
    bench_select_spawn_decision
);
criterion_main!(benches);
