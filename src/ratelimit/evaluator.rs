//! Admission evaluation against the shared bucket store.
//!
//! Two strategies make the refill-decide-consume step safe across processes:
//!
//! - [`Strategy::Atomic`] hands the whole step to the store, which runs it
//!   without interleaving any other caller on the same key.
//! - [`Strategy::Locked`] takes a short-lived lock, reads, computes locally,
//!   writes back, and unlocks. A caller that finds the lock held is denied
//!   immediately. Under heavy traffic on one bucket this denies requests
//!   that would have found tokens; that is accepted in exchange for never
//!   waiting on the lock.
//!
//! Every store round trip is bounded by a timeout, and every failure denies.
//! Under the locked strategy no call may run past the lock's expiry: a check
//! that cannot finish its write while the lock is still held is denied and
//! leaves the record untouched.
//! Caller and store clocks are not synchronized; skew only shifts when a
//! token becomes available, and a `now` behind the stored timestamp never
//! moves it backwards.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::bucket::Bucket;
use crate::config::StoreConfig;
use crate::error::AdmissionError;
use crate::store::BucketStore;

/// Default bound on a single store round trip.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(50);
/// Default expiry of a bucket lock.
const DEFAULT_LOCK_TTL: Duration = Duration::from_millis(200);

/// How the evaluator keeps concurrent checks on one bucket consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Store-side scripted step, no lock.
    #[default]
    Atomic,
    /// Lock, read, compute locally, write, unlock.
    Locked,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Atomic => "atomic",
            Strategy::Locked => "locked",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "atomic" => Ok(Strategy::Atomic),
            "locked" => Ok(Strategy::Locked),
            other => Err(format!("unknown strategy '{}', expected atomic or locked", other)),
        }
    }
}

/// One admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub bucket_name: String,
    pub now: DateTime<Utc>,
}

impl AdmissionRequest {
    pub fn new(bucket_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            now,
        }
    }
}

/// Decision for one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionResult {
    pub allowed: bool,
    pub tokens_remaining: u64,
}

impl AdmissionResult {
    /// Fail-closed decision used for every error path.
    pub fn denied() -> Self {
        Self {
            allowed: false,
            tokens_remaining: 0,
        }
    }
}

/// Evaluates admission checks against the bucket store.
pub struct AdmissionEvaluator {
    store: Arc<dyn BucketStore>,
    strategy: Strategy,
    call_timeout: Duration,
    lock_ttl: Duration,
}

impl AdmissionEvaluator {
    /// Create an evaluator.
    ///
    /// A store without server-side scripting cannot run the atomic strategy;
    /// the evaluator falls back to the locked one.
    pub fn new(store: Arc<dyn BucketStore>, strategy: Strategy) -> Self {
        let strategy = if strategy == Strategy::Atomic && !store.supports_atomic() {
            warn!("Bucket store has no server-side scripting, falling back to locked strategy");
            Strategy::Locked
        } else {
            strategy
        };

        Self {
            store,
            strategy,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Create an evaluator using the timeouts from store configuration.
    pub fn from_config(store: Arc<dyn BucketStore>, strategy: Strategy, config: &StoreConfig) -> Self {
        Self::new(store, strategy)
            .with_call_timeout(config.call_timeout())
            .with_lock_ttl(config.lock_ttl())
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// The strategy in effect after any fallback.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Evaluate a check, reporting why it failed if it did.
    pub async fn evaluate(
        &self,
        request: &AdmissionRequest,
    ) -> Result<AdmissionResult, AdmissionError> {
        match self.strategy {
            Strategy::Atomic => self.evaluate_atomic(&request.bucket_name, request.now).await,
            Strategy::Locked => self.evaluate_locked(&request.bucket_name, request.now).await,
        }
    }

    /// Evaluate a check and deny on any failure.
    pub async fn check_at(&self, bucket: &str, now: DateTime<Utc>) -> AdmissionResult {
        let request = AdmissionRequest::new(bucket, now);

        match self.evaluate(&request).await {
            Ok(result) => {
                if result.allowed {
                    trace!(bucket = %bucket, tokens_remaining = result.tokens_remaining, "Admitted");
                } else {
                    debug!(bucket = %bucket, "Bucket exhausted");
                }
                result
            }
            Err(AdmissionError::LockContention(_)) => {
                debug!(bucket = %bucket, "Bucket locked by another caller, denying");
                AdmissionResult::denied()
            }
            Err(e) => {
                warn!(
                    bucket = %bucket,
                    strategy = %self.strategy,
                    kind = e.kind(),
                    error = %e,
                    "Admission check failed, denying"
                );
                AdmissionResult::denied()
            }
        }
    }

    async fn evaluate_atomic(
        &self,
        bucket: &str,
        now: DateTime<Utc>,
    ) -> Result<AdmissionResult, AdmissionError> {
        let outcome = self
            .bounded("eval_atomic", self.store.eval_atomic(bucket, now))
            .await?;

        Ok(AdmissionResult {
            allowed: outcome.allowed,
            tokens_remaining: outcome.tokens_remaining,
        })
    }

    async fn evaluate_locked(
        &self,
        bucket: &str,
        now: DateTime<Utc>,
    ) -> Result<AdmissionResult, AdmissionError> {
        let token = uuid::Uuid::new_v4().to_string();
        // The store starts the lock TTL no earlier than this instant.
        let lock_deadline = Instant::now() + self.lock_ttl;
        let acquired = self
            .bounded_until(
                lock_deadline,
                "try_lock",
                self.store.try_lock(bucket, &token, self.lock_ttl),
            )
            .await?;
        if !acquired {
            return Err(AdmissionError::LockContention(bucket.to_string()));
        }

        let guard = LockGuard::new(self.store.clone(), bucket, token);
        let result = self.read_refill_write(bucket, now, lock_deadline).await;
        guard.release(self.call_timeout).await;
        result
    }

    async fn read_refill_write(
        &self,
        bucket: &str,
        now: DateTime<Utc>,
        lock_deadline: Instant,
    ) -> Result<AdmissionResult, AdmissionError> {
        let raw = self
            .bounded_until(lock_deadline, "get", self.store.get(bucket))
            .await?
            .ok_or_else(|| AdmissionError::ConfigurationMissing(bucket.to_string()))?;

        let mut record = Bucket::decode(bucket, &raw)?;
        let allowed = record.admit(now);
        let encoded = record.encode(bucket)?;

        self.bounded_until(lock_deadline, "set", self.store.set(bucket, &encoded))
            .await?;

        Ok(AdmissionResult {
            allowed,
            tokens_remaining: record.tokens,
        })
    }

    async fn bounded<T, F>(&self, op: &'static str, call: F) -> Result<T, AdmissionError>
    where
        F: Future<Output = Result<T, AdmissionError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::StoreUnavailable(format!(
                "{} timed out after {:?}",
                op, self.call_timeout
            ))),
        }
    }

    /// Like `bounded`, but never lets the call outlive the lock.
    ///
    /// A write that could land after the lock expired might overwrite a
    /// newer holder's update, so the call is abandoned and the check denied.
    async fn bounded_until<T, F>(
        &self,
        lock_deadline: Instant,
        op: &'static str,
        call: F,
    ) -> Result<T, AdmissionError>
    where
        F: Future<Output = Result<T, AdmissionError>>,
    {
        let remaining = lock_deadline.saturating_duration_since(Instant::now());
        if remaining >= self.call_timeout {
            return self.bounded(op, call).await;
        }
        if remaining.is_zero() {
            return Err(AdmissionError::StoreUnavailable(format!(
                "lock ttl of {:?} elapsed before {}",
                self.lock_ttl, op
            )));
        }

        match tokio::time::timeout(remaining, call).await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::StoreUnavailable(format!(
                "{} did not finish within lock ttl of {:?}",
                op, self.lock_ttl
            ))),
        }
    }
}

/// Holds a bucket lock until released.
///
/// `release` is awaited on every normal return. If the owning future is
/// dropped first, `Drop` schedules the unlock on the current runtime; the
/// lock TTL covers the case where no runtime is available.
struct LockGuard {
    store: Arc<dyn BucketStore>,
    bucket: String,
    token: String,
    released: bool,
}

impl LockGuard {
    fn new(store: Arc<dyn BucketStore>, bucket: &str, token: String) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            token,
            released: false,
        }
    }

    async fn release(mut self, timeout: Duration) {
        self.released = true;
        match tokio::time::timeout(timeout, self.store.unlock(&self.bucket, &self.token)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(bucket = %self.bucket, error = %e, "Unlock failed, lock will expire by TTL");
            }
            Err(_) => {
                warn!(bucket = %self.bucket, "Unlock timed out, lock will expire by TTL");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = self.store.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.unlock(&bucket, &token).await {
                debug!(bucket = %bucket, error = %e, "Deferred unlock failed");
            }
        });
    }
}
