//! Tests against a live Redis instance.
//!
//! Ignored by default. Run with:
//! `REDIS_URL=redis://127.0.0.1:6379/15 cargo test --test redis_store -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;

use bucketgate::config::StoreConfig;
use bucketgate::error::AdmissionError;
use bucketgate::ratelimit::{
    AdmissionEvaluator, AdmissionRequest, Bucket, BucketSpec, LimiterRegistry, Strategy,
};
use bucketgate::store::{BucketStore, RedisBucketStore};

fn t0() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
}

fn store_config() -> StoreConfig {
    StoreConfig {
        url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".into()),
        // Fresh namespace per test so runs never see each other's buckets.
        key_prefix: format!("bucketgate-test:{}:", uuid::Uuid::new_v4()),
        call_timeout_ms: 1_000,
        ..StoreConfig::default()
    }
}

async fn connect(config: &StoreConfig) -> Arc<RedisBucketStore> {
    Arc::new(RedisBucketStore::connect(config).await.expect("redis reachable"))
}

#[tokio::test]
#[ignore]
async fn test_registered_bucket_round_trips() {
    let store = connect(&store_config()).await;
    let registry = LimiterRegistry::new(store.clone());
    let spec = BucketSpec::new("default", 10, Duration::from_secs(1));

    registry.register(&spec, t0()).await.unwrap();

    let bucket = registry.current("default").await.unwrap();
    assert_eq!(bucket, Bucket::new(10, Duration::from_secs(1), t0()));

    registry.remove("default").await.unwrap();
    assert!(store.get("default").await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_script_matches_local_arithmetic() {
    let store = connect(&store_config()).await;
    let mut local = Bucket::new(4, Duration::from_millis(300), t0());
    store.set("mirror", &local.encode("mirror").unwrap()).await.unwrap();

    let offsets = [0, 0, 0, 0, 0, 100, 350, 1_000, 1_001, 5_000, 4_000, 5_300];
    for offset in offsets {
        let now = t0() + chrono::Duration::milliseconds(offset);
        let expected = local.admit(now);

        let outcome = store.eval_atomic("mirror", now).await.unwrap();
        assert_eq!(outcome.allowed, expected, "offset {}", offset);
        assert_eq!(outcome.tokens_remaining, local.tokens, "offset {}", offset);

        let raw = store.get("mirror").await.unwrap().unwrap();
        assert_eq!(Bucket::decode("mirror", &raw).unwrap(), local, "offset {}", offset);
    }
}

#[tokio::test]
#[ignore]
async fn test_script_status_codes() {
    let store = connect(&store_config()).await;

    assert_eq!(
        store.eval_atomic("missing", t0()).await,
        Err(AdmissionError::ConfigurationMissing("missing".to_string()))
    );

    store.set("corrupt", b"{not json").await.unwrap();
    assert!(matches!(
        store.eval_atomic("corrupt", t0()).await,
        Err(AdmissionError::Serialization { .. })
    ));
}

#[tokio::test]
#[ignore]
async fn test_lock_ownership() {
    let store = connect(&store_config()).await;
    let ttl = Duration::from_secs(5);

    assert!(store.try_lock("b", "owner-1", ttl).await.unwrap());
    assert!(!store.try_lock("b", "owner-2", ttl).await.unwrap());

    store.unlock("b", "owner-2").await.unwrap();
    assert!(!store.try_lock("b", "owner-3", ttl).await.unwrap());

    store.unlock("b", "owner-1").await.unwrap();
    assert!(store.try_lock("b", "owner-3", ttl).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_lock_expires() {
    let store = connect(&store_config()).await;

    assert!(store.try_lock("b", "crashed", Duration::from_millis(50)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(store.try_lock("b", "next", Duration::from_millis(50)).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn test_atomic_exact_across_connections() {
    const CAPACITY: u64 = 40;
    const CALLERS: usize = 160;

    // Separate connections stand in for separate serving processes.
    let config = store_config();
    let mut evaluators = Vec::new();
    for _ in 0..4 {
        let store = connect(&config).await;
        evaluators.push(Arc::new(
            AdmissionEvaluator::from_config(store, Strategy::Atomic, &config),
        ));
    }
    LimiterRegistry::new(connect(&config).await)
        .register(&BucketSpec::new("shared", CAPACITY, Duration::from_secs(3600)), t0())
        .await
        .unwrap();

    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let evaluator = evaluators[i % evaluators.len()].clone();
            tokio::spawn(async move {
                evaluator
                    .evaluate(&AdmissionRequest::new("shared", t0()))
                    .await
            })
        })
        .collect();

    let mut admitted = 0;
    for outcome in join_all(handles).await {
        if outcome.unwrap().unwrap().allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, CAPACITY);
}
