//! Token bucket record and refill arithmetic.
//!
//! The record is the only persisted state of the limiter. It is stored as
//! JSON with millisecond integers so that the Rust codec and the store-side
//! Lua script read and write exactly the same representation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;

/// Persisted state of one named token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Maximum tokens the bucket can hold.
    pub capacity: u64,
    /// Time needed to regenerate one token.
    #[serde(with = "duration_millis")]
    pub fill_rate: Duration,
    /// Tokens currently available.
    pub tokens: u64,
    /// Last moment refill was computed.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_fill_time: DateTime<Utc>,
}

impl Bucket {
    /// Create a full bucket.
    pub fn new(capacity: u64, fill_rate: Duration, now: DateTime<Utc>) -> Self {
        Self {
            capacity,
            fill_rate,
            tokens: capacity,
            last_fill_time: now,
        }
    }

    /// Number of whole tokens regenerated between `last_fill_time` and `now`.
    ///
    /// A `now` earlier than `last_fill_time` (caller clock behind the writer's)
    /// regenerates nothing.
    pub fn tokens_due(&self, now: DateTime<Utc>) -> u64 {
        let elapsed = match (now - self.last_fill_time).to_std() {
            Ok(elapsed) => elapsed,
            Err(_) => return 0,
        };
        let fill_ms = self.fill_rate.as_millis();
        if fill_ms == 0 {
            return 0;
        }
        u64::try_from(elapsed.as_millis() / fill_ms).unwrap_or(u64::MAX)
    }

    /// Apply refill up to capacity and advance `last_fill_time` to `now`.
    ///
    /// The timestamp moves on every call, whether or not a whole token was
    /// added. It never moves backwards.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        let added = self.tokens_due(now);
        self.tokens = self.tokens.saturating_add(added).min(self.capacity);
        if now > self.last_fill_time {
            self.last_fill_time = now;
        }
    }

    /// Take one token if any is available.
    pub fn try_consume(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Refill, decide, and consume in one step.
    ///
    /// Returns `true` if a token was taken.
    pub fn admit(&mut self, now: DateTime<Utc>) -> bool {
        self.refill(now);
        self.try_consume()
    }

    /// Encode the record for the store.
    pub fn encode(&self, name: &str) -> Result<Vec<u8>, AdmissionError> {
        serde_json::to_vec(self).map_err(|e| AdmissionError::serialization(name, e))
    }

    /// Decode and sanity-check a stored record.
    ///
    /// Tokens above capacity are clamped so the invariant holds for any
    /// record that decodes.
    pub fn decode(name: &str, raw: &[u8]) -> Result<Self, AdmissionError> {
        let mut bucket: Bucket =
            serde_json::from_slice(raw).map_err(|e| AdmissionError::serialization(name, e))?;

        if bucket.capacity == 0 {
            return Err(AdmissionError::serialization(name, "capacity is zero"));
        }
        if bucket.fill_rate.as_millis() == 0 {
            return Err(AdmissionError::serialization(name, "fill_rate is zero"));
        }
        bucket.tokens = bucket.tokens.min(bucket.capacity);
        Ok(bucket)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
