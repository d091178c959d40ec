//! End-to-end instance-pool scenarios and universal invariants.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use muster_core::config::Config;
use muster_core::engine::{ChatArgs, ChatMessage, ChatRole, EngineAdapter, TaskOptions};
use muster_core::instance::TaskOptionsOverride;
use muster_core::store::{DevicePreference, ModelConfig, PrepareMode, TaskKind};
use muster_core::test_support::FakeEngineAdapter;
use muster_core::{PoolError, Runtime};

fn model(id: &str, max_instances: u32, min_instances: u32) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        engine: "fake".to_string(),
        task: TaskKind::TextCompletion,
        source: None,
        checksum: None,
        min_instances,
        max_instances,
        ttl_secs: 60,
        device: DevicePreference::Auto,
        prepare: PrepareMode::Blocking,
        defaults: serde_json::Value::Null,
    }
}

fn user(text: &str) -> ChatMessage {
    ChatMessage { role: ChatRole::User, content: text.to_string() }
}

fn assistant(text: &str) -> ChatMessage {
    ChatMessage { role: ChatRole::Assistant, content: text.to_string() }
}

fn chat_args(messages: Vec<ChatMessage>) -> ChatArgs {
    ChatArgs { messages, opts: TaskOptions::default() }
}

async fn runtime_with(models: Vec<ModelConfig>, engine: Arc<FakeEngineAdapter>) -> Arc<Runtime> {
    let mut config = Config::default();
    config.concurrency = 1;
    for m in models {
        config.models.insert(m.id.clone(), m);
    }
    let mut engines: HashMap<String, Arc<dyn EngineAdapter>> = HashMap::new();
    engines.insert("fake".to_string(), engine as Arc<dyn EngineAdapter>);
    let runtime = Runtime::new(config, engines).expect("runtime construction must succeed");
    runtime.init().await.expect("model preparation must succeed against the fake engine");
    runtime
}

#[tokio::test]
async fn cache_reuse_routes_continuation_to_the_original_instance() {
    let engine = Arc::new(FakeEngineAdapter::new("fake"));
    let runtime = runtime_with(vec![model("test", 2, 0)], engine).await;

    let overrides = TaskOptionsOverride::default();
    let a1 = runtime
        .submit_chat_completion("test", chat_args(vec![user("Haiku about bears")]), overrides.clone())
        .await
        .unwrap();

    let pool_status = runtime.pool_status().await;
    let instance_a = pool_status.instances[0].id.clone();

    runtime
        .submit_chat_completion("test", chat_args(vec![user("Haiku about pancakes")]), overrides.clone())
        .await
        .unwrap();

    let status_after_b = runtime.pool_status().await;
    assert_eq!(status_after_b.instances.len(), 2, "a second instance must have been spawned for B");

    runtime
        .submit_chat_completion(
            "test",
            chat_args(vec![
                user("Haiku about bears"),
                assistant(&a1.message.content),
                user("Six-word title"),
            ]),
            overrides,
        )
        .await
        .unwrap();

    // A' must reuse an existing instance rather than spawn a third one.
    let final_status = runtime.pool_status().await;
    assert_eq!(final_status.instances.len(), 2, "continuation must reuse an existing instance, not spawn a third");
    assert!(final_status.instances.iter().any(|i| i.id == instance_a));
}

#[tokio::test]
async fn context_leak_prevention_keeps_secrets_off_other_instances() {
    let engine = Arc::new(FakeEngineAdapter::new("fake"));
    let runtime = runtime_with(vec![model("test", 2, 0)], engine).await;
    let overrides = TaskOptionsOverride::default();

    let a1 = runtime
        .submit_chat_completion(
            "test",
            chat_args(vec![user("Remember: axolotls regrow limbs. Answer OK.")]),
            overrides.clone(),
        )
        .await
        .unwrap();
    let status_after_a = runtime.pool_status().await;
    let instance_a = status_after_a.instances[0].id.clone();

    runtime
        .submit_chat_completion("test", chat_args(vec![user("Tell me one animal fact")]), overrides.clone())
        .await
        .unwrap();
    let status_after_b = runtime.pool_status().await;
    assert_eq!(
        status_after_b.instances.len(),
        2,
        "a conversation with no matching context hash must be served by a different idle instance, never one holding another conversation's state"
    );
    assert!(status_after_b.instances.iter().any(|i| i.id != instance_a));

    // The continuation of A must route back to instance A, not the one that
    // just served B (the only one that could leak A's secret back into it).
    runtime
        .submit_chat_completion(
            "test",
            chat_args(vec![
                user("Remember: axolotls regrow limbs. Answer OK."),
                assistant(&a1.message.content),
                user("Tell me one animal fact"),
            ]),
            overrides,
        )
        .await
        .unwrap();
    let final_status = runtime.pool_status().await;
    assert_eq!(final_status.instances.len(), 2, "A's continuation must route back to instance A, not spawn or reuse B's");
}

#[tokio::test]
async fn concurrency_cap_admits_only_one_inflight_task_at_a_time() {
    let engine = Arc::new(FakeEngineAdapter::new("fake").with_latency(Duration::from_millis(40)));
    let runtime = runtime_with(vec![model("test", 2, 0)], Arc::clone(&engine)).await;

    let r1 = Arc::clone(&runtime);
    let r2 = Arc::clone(&runtime);
    let t1 = tokio::spawn(async move {
        r1.submit_chat_completion("test", chat_args(vec![user("one")]), TaskOptionsOverride::default()).await
    });
    let t2 = tokio::spawn(async move {
        r2.submit_chat_completion("test", chat_args(vec![user("two")]), TaskOptionsOverride::default()).await
    });

    let (res1, res2) = tokio::join!(t1, t2);
    res1.unwrap().unwrap();
    res2.unwrap().unwrap();

    assert_eq!(engine.max_observed_concurrency(), 1, "concurrency=1 must serialize engine execution");
}

#[tokio::test]
async fn spawns_a_second_instance_under_overlapping_load() {
    let engine = Arc::new(FakeEngineAdapter::new("fake").with_latency(Duration::from_millis(30)));
    let mut config = Config::default();
    config.concurrency = 2;
    config.models.insert("test".to_string(), model("test", 2, 1));
    let mut engines: HashMap<String, Arc<dyn EngineAdapter>> = HashMap::new();
    engines.insert("fake".to_string(), Arc::clone(&engine) as Arc<dyn EngineAdapter>);
    let runtime = Runtime::new(config, engines).unwrap();
    runtime.init().await.unwrap(); // minInstances=1 forces a blocking warm instance

    let r1 = Arc::clone(&runtime);
    let r2 = Arc::clone(&runtime);
    let t1 = tokio::spawn(async move {
        r1.submit_chat_completion("test", chat_args(vec![user("one")]), TaskOptionsOverride::default()).await
    });
    let t2 = tokio::spawn(async move {
        r2.submit_chat_completion("test", chat_args(vec![user("two")]), TaskOptionsOverride::default()).await
    });
    let (res1, res2) = tokio::join!(t1, t2);
    res1.unwrap().unwrap();
    res2.unwrap().unwrap();

    assert_eq!(engine.create_call_count(), 2, "the pool must spawn a second instance rather than serialize both");
}

#[tokio::test]
async fn cancellation_before_lock_leaves_no_waiter_behind() {
    let engine = Arc::new(FakeEngineAdapter::new("fake").with_latency(Duration::from_millis(50)));
    let runtime = runtime_with(vec![model("test", 1, 0)], Arc::clone(&engine)).await;

    let r1 = Arc::clone(&runtime);
    let holder = tokio::spawn(async move {
        r1.submit_chat_completion("test", chat_args(vec![user("hold")]), TaskOptionsOverride::default()).await
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let signal = CancellationToken::new();
    let overrides = TaskOptionsOverride { caller_signal: Some(signal.clone()), timeout: None };
    let r2 = Arc::clone(&runtime);
    let waiter = tokio::spawn(async move {
        r2.submit_chat_completion("test", chat_args(vec![user("wait")]), overrides).await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    signal.cancel();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(PoolError::Cancelled)));

    holder.await.unwrap().unwrap();
    let status = runtime.pool_status().await;
    assert_eq!(status.waiting, 0, "a cancelled waiter must leave no waiter-queue entry behind");
}

#[tokio::test]
async fn metrics_snapshot_reflects_completed_requests() {
    let engine = Arc::new(FakeEngineAdapter::new("fake"));
    let runtime = runtime_with(vec![model("test", 1, 0)], engine).await;

    runtime
        .submit_chat_completion("test", chat_args(vec![user("hi")]), TaskOptionsOverride::default())
        .await
        .unwrap();

    let snapshot = runtime.metrics_snapshot();
    assert_eq!(snapshot.counters["pool_requests_total{model=\"test\"}"], 1);
    assert_eq!(snapshot.counters["pool_requests_succeeded{model=\"test\"}"], 1);
}

#[tokio::test]
async fn timeout_returns_partial_result_and_frees_the_instance() {
    let engine = Arc::new(FakeEngineAdapter::new("fake").with_latency(Duration::from_millis(200)));
    let runtime = runtime_with(vec![model("test", 1, 0)], Arc::clone(&engine)).await;

    let overrides = TaskOptionsOverride { caller_signal: None, timeout: Some(Duration::from_millis(20)) };
    let result = runtime
        .submit_chat_completion("test", chat_args(vec![user("slow")]), overrides)
        .await
        .unwrap();
    assert_eq!(result.finish_reason, muster_core::engine::FinishReason::Timeout);

    // The instance must have returned to idle: a subsequent request succeeds
    // without spawning a second instance.
    let second = runtime
        .submit_chat_completion("test", chat_args(vec![user("again")]), TaskOptionsOverride::default())
        .await;
    assert!(second.is_ok());
    assert_eq!(engine.create_call_count(), 1);
}
