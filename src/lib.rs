//! Bucketgate - Shared Token Bucket Admission Control
//!
//! This crate implements named token-bucket rate limiters whose state lives
//! in a shared coordination store (Redis), so every serving process sees and
//! mutates the same buckets. A gate in front of request handlers asks the
//! limiter once per request and answers with backpressure when a bucket is
//! empty. Any failure to reach or read the store denies the request.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod store;
