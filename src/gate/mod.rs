//! Per-request admission gate.
//!
//! The gate resolves which bucket governs a request, asks the admission
//! backend once, and either lets the request through untouched or answers
//! with backpressure. It keeps no state and never retries.

mod middleware;
mod server;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::config::RateLimitingConfig;
use crate::ratelimit::{AdmissionBackend, BucketSpec};

pub use middleware::gate_middleware;
pub use server::GateServer;

/// Retry hint used when the denied bucket has no known fill rate.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

const BACKPRESSURE_MESSAGE: &str = "too many requests, please retry later";

/// Maps request paths to bucket names.
///
/// The longest declared route prefix wins; paths no route claims fall to the
/// default bucket.
#[derive(Debug, Clone)]
pub struct BucketResolver {
    default: BucketSpec,
    buckets: Vec<BucketSpec>,
    routes: Vec<(String, usize)>,
}

impl BucketResolver {
    /// Create a resolver that sends every path to `default`.
    pub fn new(default: BucketSpec) -> Self {
        Self {
            default,
            buckets: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Build a resolver from the declared buckets.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        config
            .locations
            .iter()
            .cloned()
            .fold(Self::new(config.default.clone()), Self::with_bucket)
    }

    /// Add a bucket and bind its route prefixes.
    pub fn with_bucket(mut self, spec: BucketSpec) -> Self {
        let index = self.buckets.len();
        for route in &spec.routes {
            self.routes.push((normalize_prefix(route), index));
        }
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self.buckets.push(spec);
        self
    }

    /// Bucket governing `path`.
    pub fn resolve(&self, path: &str) -> &BucketSpec {
        self.routes
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, index)| &self.buckets[*index])
            .unwrap_or(&self.default)
    }

    /// Declared bucket by name.
    pub fn spec(&self, name: &str) -> Option<&BucketSpec> {
        if self.default.name == name {
            return Some(&self.default);
        }
        self.buckets.iter().find(|spec| spec.name == name)
    }

    /// Name of the default bucket.
    pub fn default_bucket(&self) -> &str {
        &self.default.name
    }
}

fn normalize_prefix(route: &str) -> String {
    let trimmed = route.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Outcome of passing one request through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Hand the request to the next stage unchanged.
    Continue {
        bucket: String,
        tokens_remaining: u64,
    },
    /// Stop the request here.
    Reject(Backpressure),
}

/// Signal returned to a caller that exceeded its bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backpressure {
    pub bucket: String,
    pub retry_after: Duration,
}

impl Backpressure {
    /// `Retry-After` value in whole seconds, at least one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }
}

#[derive(Serialize)]
struct BackpressureBody<'a> {
    success: bool,
    message: &'a str,
    bucket: &'a str,
}

impl IntoResponse for Backpressure {
    fn into_response(self) -> Response {
        let body = BackpressureBody {
            success: false,
            message: BACKPRESSURE_MESSAGE,
            bucket: &self.bucket,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, self.retry_after_secs().into());
        response
    }
}

/// Admission gate placed in front of request handlers.
pub struct Gate {
    backend: Arc<dyn AdmissionBackend>,
    resolver: BucketResolver,
}

impl Gate {
    pub fn new(backend: Arc<dyn AdmissionBackend>, resolver: BucketResolver) -> Self {
        Self { backend, resolver }
    }

    pub fn resolver(&self) -> &BucketResolver {
        &self.resolver
    }

    /// Admit a request by its path.
    pub async fn admit_path(&self, path: &str) -> GateDecision {
        let bucket = self.resolver.resolve(path).name.clone();
        self.admit_bucket(&bucket).await
    }

    /// Admit a request against an explicitly named bucket.
    pub async fn admit_bucket(&self, bucket: &str) -> GateDecision {
        let result = self.backend.check(bucket).await;
        if result.allowed {
            return GateDecision::Continue {
                bucket: bucket.to_string(),
                tokens_remaining: result.tokens_remaining,
            };
        }

        let retry_after = self
            .resolver
            .spec(bucket)
            .map(BucketSpec::fill_rate)
            .unwrap_or(DEFAULT_RETRY_AFTER);

        GateDecision::Reject(Backpressure {
            bucket: bucket.to_string(),
            retry_after,
        })
    }
}
