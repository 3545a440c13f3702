//! Coordination store holding bucket records.
//!
//! The store is the single source of truth shared by every serving process.
//! Buckets are addressed by name only; nothing in a process holds
//! authoritative limiter state.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AdmissionError;

pub use self::memory::MemoryBucketStore;
pub use self::redis_store::RedisBucketStore;

/// Outcome of one store-side refill-decide-consume step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicOutcome {
    /// Whether a token was taken.
    pub allowed: bool,
    /// Tokens left after the step.
    pub tokens_remaining: u64,
}

/// Storage and coordination operations the limiter needs from the store.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the serialized record for a bucket.
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, AdmissionError>;

    /// Overwrite the serialized record for a bucket.
    async fn set(&self, name: &str, value: &[u8]) -> Result<(), AdmissionError>;

    /// Remove a bucket record.
    async fn delete(&self, name: &str) -> Result<(), AdmissionError>;

    /// Take the bucket lock if nobody holds it. The lock expires after `ttl`.
    async fn try_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, AdmissionError>;

    /// Release the bucket lock if it is still held under `token`.
    async fn unlock(&self, name: &str, token: &str) -> Result<(), AdmissionError>;

    /// Run refill, decide, and consume as a single indivisible store-side step.
    async fn eval_atomic(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<AtomicOutcome, AdmissionError>;

    /// Whether `eval_atomic` is available on this store.
    fn supports_atomic(&self) -> bool {
        true
    }
}
