//! In-process bucket store.
//!
//! Mirrors the semantics of the Redis store inside one process: records are
//! opaque bytes, locks expire after their TTL, and `eval_atomic` holds the
//! per-key shard lock for the whole refill-decide-consume step. Useful for
//! tests and single-node development. Round-trip latency and outages can be
//! injected to exercise the concurrency and fail-closed paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{AtomicOutcome, BucketStore};
use crate::error::AdmissionError;
use crate::ratelimit::Bucket;

#[derive(Debug)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// Bucket store kept in process memory.
#[derive(Debug)]
pub struct MemoryBucketStore {
    records: DashMap<String, Vec<u8>>,
    locks: Mutex<HashMap<String, LockEntry>>,
    latency: Duration,
    scripting: bool,
    unavailable: AtomicBool,
}

impl MemoryBucketStore {
    /// Create an empty store with no injected latency.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            locks: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            scripting: true,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Delay every call by `latency` to simulate a network round trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Behave like a store without server-side scripting.
    pub fn without_scripting(mut self) -> Self {
        self.scripting = false;
        self
    }

    /// Make every subsequent call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether a live (unexpired) lock exists for a bucket.
    pub fn is_locked(&self, name: &str) -> bool {
        let locks = self.locks.lock();
        locks
            .get(name)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Decode the current record for a bucket, bypassing latency and outages.
    pub fn snapshot(&self, name: &str) -> Option<Bucket> {
        let raw = self.records.get(name)?;
        Bucket::decode(name, raw.value()).ok()
    }

    async fn round_trip(&self) -> Result<(), AdmissionError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AdmissionError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, AdmissionError> {
        self.round_trip().await?;
        Ok(self.records.get(name).map(|raw| raw.value().clone()))
    }

    async fn set(&self, name: &str, value: &[u8]) -> Result<(), AdmissionError> {
        self.round_trip().await?;
        self.records.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), AdmissionError> {
        self.round_trip().await?;
        self.records.remove(name);
        Ok(())
    }

    async fn try_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, AdmissionError> {
        self.round_trip().await?;

        let now = Instant::now();
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(name) {
            if existing.expires_at > now {
                return Ok(false);
            }
            trace!(bucket = %name, "Expired lock reclaimed");
        }
        locks.insert(
            name.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<(), AdmissionError> {
        self.round_trip().await?;

        let mut locks = self.locks.lock();
        if locks.get(name).map(|entry| entry.token == token).unwrap_or(false) {
            locks.remove(name);
        }
        Ok(())
    }

    async fn eval_atomic(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<AtomicOutcome, AdmissionError> {
        self.round_trip().await?;
        if !self.scripting {
            return Err(AdmissionError::StoreUnavailable(
                "server-side scripting not supported".to_string(),
            ));
        }

        // The shard write lock is held until `entry` drops, so no other call
        // on this key interleaves with the step below.
        let mut entry = self
            .records
            .get_mut(name)
            .ok_or_else(|| AdmissionError::ConfigurationMissing(name.to_string()))?;

        let mut bucket = Bucket::decode(name, entry.value())?;
        let allowed = bucket.admit(now);
        *entry = bucket.encode(name)?;

        Ok(AtomicOutcome {
            allowed,
            tokens_remaining: bucket.tokens,
        })
    }

    fn supports_atomic(&self) -> bool {
        self.scripting
    }
}
