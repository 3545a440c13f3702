//! Admission backend trait for abstracting the evaluator behind the gate.

use async_trait::async_trait;
use chrono::Utc;

use super::evaluator::{AdmissionEvaluator, AdmissionResult};

/// Trait for anything that can decide admission for a named bucket.
///
/// The gate only depends on this trait, so request pipelines can be tested
/// against a scripted backend and run against the store-backed evaluator.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Decide admission for one request against `bucket`, using the current time.
    ///
    /// Implementations never fail: any error is a deny.
    async fn check(&self, bucket: &str) -> AdmissionResult;
}

#[async_trait]
impl AdmissionBackend for AdmissionEvaluator {
    async fn check(&self, bucket: &str) -> AdmissionResult {
        self.check_at(bucket, Utc::now()).await
    }
}
