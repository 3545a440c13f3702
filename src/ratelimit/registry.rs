//! Bucket declarations and boot-time initialization.
//!
//! Every declared bucket is written once at startup with a full token count.
//! Writes overwrite whatever the store held before; several processes booting
//! together simply race to the same initial record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::bucket::Bucket;
use crate::error::{AdmissionError, BucketgateError, Result};
use crate::store::BucketStore;

/// Static parameters of one named bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Globally unique bucket name
    pub name: String,
    /// Maximum tokens
    pub capacity: u64,
    /// Milliseconds needed to regenerate one token
    pub fill_rate_ms: u64,
    /// Request path prefixes governed by this bucket
    #[serde(default)]
    pub routes: Vec<String>,
}

impl BucketSpec {
    /// Create a spec that is not bound to any route.
    pub fn new(name: impl Into<String>, capacity: u64, fill_rate: Duration) -> Self {
        Self {
            name: name.into(),
            capacity,
            fill_rate_ms: u64::try_from(fill_rate.as_millis()).unwrap_or(u64::MAX),
            routes: Vec::new(),
        }
    }

    /// Bind route prefixes to this bucket.
    pub fn with_routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes = routes.into_iter().map(Into::into).collect();
        self
    }

    pub fn fill_rate(&self) -> Duration {
        Duration::from_millis(self.fill_rate_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BucketgateError::Config("bucket name is empty".to_string()));
        }
        if self.capacity == 0 {
            return Err(BucketgateError::Config(format!(
                "bucket '{}' has zero capacity",
                self.name
            )));
        }
        if self.fill_rate_ms == 0 {
            return Err(BucketgateError::Config(format!(
                "bucket '{}' has zero fill rate",
                self.name
            )));
        }
        Ok(())
    }
}

/// Writes the initial state of declared buckets to the store.
pub struct LimiterRegistry {
    store: Arc<dyn BucketStore>,
}

impl LimiterRegistry {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self { store }
    }

    /// Write a full bucket for `spec`, replacing any previous record.
    pub async fn register(&self, spec: &BucketSpec, now: DateTime<Utc>) -> Result<Bucket> {
        spec.validate()?;

        let bucket = Bucket::new(spec.capacity, spec.fill_rate(), now);
        let encoded = bucket.encode(&spec.name)?;

        self.store.set(&spec.name, &encoded).await?;

        info!(
            bucket = %spec.name,
            capacity = spec.capacity,
            fill_rate_ms = spec.fill_rate_ms,
            "Bucket registered"
        );
        Ok(bucket)
    }

    /// Register every spec, stopping at the first failure.
    pub async fn register_all<'a, I>(&self, specs: I, now: DateTime<Utc>) -> Result<usize>
    where
        I: IntoIterator<Item = &'a BucketSpec>,
    {
        let mut count = 0;
        for spec in specs {
            self.register(spec, now).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Read back the current record of a bucket.
    pub async fn current(&self, name: &str) -> std::result::Result<Bucket, AdmissionError> {
        match self.store.get(name).await? {
            Some(raw) => Bucket::decode(name, &raw),
            None => Err(AdmissionError::ConfigurationMissing(name.to_string())),
        }
    }

    /// Remove a bucket record entirely.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.store.delete(name).await?;
        info!(bucket = %name, "Bucket removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBucketStore;

    fn registry() -> (Arc<MemoryBucketStore>, LimiterRegistry) {
        let store = Arc::new(MemoryBucketStore::new());
        let registry = LimiterRegistry::new(store.clone());
        (store, registry)
    }

    #[test]
    fn test_spec_validation() {
        assert!(BucketSpec::new("ok", 1, Duration::from_millis(1)).validate().is_ok());
        assert!(BucketSpec::new("", 1, Duration::from_secs(1)).validate().is_err());
        assert!(BucketSpec::new("zero", 0, Duration::from_secs(1)).validate().is_err());
        assert!(BucketSpec::new("slow", 1, Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_spec_routes() {
        let spec = BucketSpec::new("uploads", 5, Duration::from_secs(2)).with_routes(["/photos"]);
        assert_eq!(spec.routes, vec!["/photos".to_string()]);
        assert_eq!(spec.fill_rate(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_register_writes_full_bucket() {
        let (store, registry) = registry();
        let now = Utc::now();
        let spec = BucketSpec::new("default", 10, Duration::from_secs(1));

        registry.register(&spec, now).await.unwrap();

        let bucket = store.snapshot("default").unwrap();
        assert_eq!(bucket.capacity, 10);
        assert_eq!(bucket.tokens, 10);
        assert_eq!(bucket.fill_rate, Duration::from_secs(1));
        assert_eq!(
            bucket.last_fill_time.timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_register_overwrites_previous_state() {
        let (store, registry) = registry();
        let spec = BucketSpec::new("default", 3, Duration::from_secs(1));
        registry.register(&spec, Utc::now()).await.unwrap();

        store.eval_atomic("default", Utc::now()).await.unwrap();
        store.eval_atomic("default", Utc::now()).await.unwrap();
        assert_eq!(store.snapshot("default").unwrap().tokens, 1);

        registry.register(&spec, Utc::now()).await.unwrap();
        assert_eq!(store.snapshot("default").unwrap().tokens, 3);
    }

    #[tokio::test]
    async fn test_register_all_counts() {
        let (_store, registry) = registry();
        let specs = vec![
            BucketSpec::new("default", 10, Duration::from_secs(1)),
            BucketSpec::new("uploads", 2, Duration::from_secs(5)),
        ];

        let count = registry.register_all(&specs, Utc::now()).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(registry.current("uploads").await.unwrap().capacity, 2);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_spec() {
        let (store, registry) = registry();
        let spec = BucketSpec::new("broken", 0, Duration::from_secs(1));

        assert!(registry.register(&spec, Utc::now()).await.is_err());
        assert!(store.snapshot("broken").is_none());
    }

    #[tokio::test]
    async fn test_register_fails_when_store_unavailable() {
        let (store, registry) = registry();
        store.set_unavailable(true);

        let spec = BucketSpec::new("default", 10, Duration::from_secs(1));
        let result = registry.register(&spec, Utc::now()).await;
        assert!(matches!(
            result,
            Err(BucketgateError::Admission(AdmissionError::StoreUnavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_current_and_remove() {
        let (_store, registry) = registry();
        let spec = BucketSpec::new("default", 10, Duration::from_secs(1));
        registry.register(&spec, Utc::now()).await.unwrap();

        registry.remove("default").await.unwrap();
        assert_eq!(
            registry.current("default").await,
            Err(AdmissionError::ConfigurationMissing("default".to_string()))
        );
    }
}
