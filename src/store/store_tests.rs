use super::*;
use crate::test_support::FakeEngineAdapter;
use std::sync::Arc;

fn config(id: &str, min_instances: u32, prepare: PrepareMode) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        engine: "fake".to_string(),
        task: TaskKind::TextCompletion,
        source: None,
        checksum: None,
        min_instances,
        max_instances: 2,
        ttl_secs: 60,
        device: DevicePreference::Auto,
        prepare,
        defaults: serde_json::Value::Null,
    }
}

fn engines() -> HashMap<String, Arc<dyn EngineAdapter>> {
    let mut map: HashMap<String, Arc<dyn EngineAdapter>> = HashMap::new();
    map.insert("fake".to_string(), Arc::new(FakeEngineAdapter::new("fake")));
    map
}

#[test]
fn rejects_invalid_model_id() {
    let mut cfg = config("bad id!", 0, PrepareMode::Async);
    cfg.id = "bad id!".to_string();
    assert!(cfg.validate().is_err());
}

#[test]
fn rejects_max_less_than_min() {
    let mut cfg = config("m1", 3, PrepareMode::Async);
    cfg.max_instances = 1;
    assert!(cfg.validate().is_err());
}

#[tokio::test]
async fn init_resolves_blocking_models_before_returning() {
    let store = Arc::new(
        ModelStore::new(vec![config("m1", 0, PrepareMode::Blocking)], engines(), 2).unwrap(),
    );
    store.init().await.unwrap();
    assert_eq!(store.status_of("m1").await, Some(ModelStatus::Ready));
}

#[tokio::test]
async fn init_resolves_min_instances_models_even_if_async() {
    let store = Arc::new(
        ModelStore::new(vec![config("m1", 1, PrepareMode::Async)], engines(), 2).unwrap(),
    );
    store.init().await.unwrap();
    assert_eq!(store.status_of("m1").await, Some(ModelStatus::Ready));
}

#[tokio::test]
async fn concurrent_prepare_calls_share_one_preparation() {
    let store = Arc::new(
        ModelStore::new(vec![config("m1", 0, PrepareMode::Async)], engines(), 2).unwrap(),
    );
    let a = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.prepare_model("m1", Default::default()).await })
    };
    let b = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.prepare_model("m1", Default::default()).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert_eq!(store.status_of("m1").await, Some(ModelStatus::Ready));
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let store = Arc::new(ModelStore::new(vec![], engines(), 2).unwrap());
    let err = store.prepare_model("missing", Default::default()).await.unwrap_err();
    assert!(matches!(err, PoolError::ModelNotFound(_)));
}

#[tokio::test]
async fn unknown_engine_is_rejected_at_construction() {
    let cfg = config("m1", 0, PrepareMode::Async);
    let result = ModelStore::new(vec![cfg], HashMap::new(), 2);
    assert!(result.is_err());
}

#[tokio::test]
async fn prepare_progress_is_recorded_on_the_store() {
    let mut engines: HashMap<String, Arc<dyn EngineAdapter>> = HashMap::new();
    engines.insert(
        "fake".to_string(),
        Arc::new(FakeEngineAdapter::new("fake").with_prepare_progress(vec![(50, 200), (200, 200)])),
    );
    let store = Arc::new(
        ModelStore::new(vec![config("m1", 0, PrepareMode::Blocking)], engines, 2).unwrap(),
    );
    store.init().await.unwrap();

    let status = store.get_status().await;
    let entry = &status["m1"];
    assert_eq!(entry.status, ModelStatus::Ready);
    assert_eq!(entry.percent, Some(100.0));
}
