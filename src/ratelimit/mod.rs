//! Token bucket state, registration, and admission evaluation.

mod backend;
mod bucket;
mod evaluator;
mod registry;

pub use backend::AdmissionBackend;
pub use bucket::Bucket;
pub use evaluator::{AdmissionEvaluator, AdmissionRequest, AdmissionResult, Strategy};
pub use registry::{BucketSpec, LimiterRegistry};
