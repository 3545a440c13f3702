//! Error types for the Bucketgate service.

use thiserror::Error;

/// Main error type for Bucketgate startup and administration paths.
#[derive(Error, Debug)]
pub enum BucketgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Admission path errors surfaced outside the request path (e.g. boot)
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Coordination store connection errors
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for BucketgateError {
    fn from(err: config::ConfigError) -> Self {
        BucketgateError::Config(err.to_string())
    }
}

/// Failures on the admission path.
///
/// Every variant is fail-closed: the evaluator turns it into a deny and the
/// serving process keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The coordination store could not be reached or did not answer in time.
    #[error("bucket store unavailable: {0}")]
    StoreUnavailable(String),

    /// The bucket record is corrupt or could not be encoded.
    #[error("bucket record for '{bucket}' is invalid: {reason}")]
    Serialization { bucket: String, reason: String },

    /// Another caller holds the bucket lock (locked strategy only).
    #[error("bucket '{0}' is locked by another caller")]
    LockContention(String),

    /// The bucket was never initialized by the registry.
    #[error("bucket '{0}' has not been registered")]
    ConfigurationMissing(String),
}

impl AdmissionError {
    pub(crate) fn serialization(bucket: &str, reason: impl ToString) -> Self {
        AdmissionError::Serialization {
            bucket: bucket.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::StoreUnavailable(_) => "store_unavailable",
            AdmissionError::Serialization { .. } => "serialization",
            AdmissionError::LockContention(_) => "lock_contention",
            AdmissionError::ConfigurationMissing(_) => "configuration_missing",
        }
    }
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        AdmissionError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Bucketgate operations.
pub type Result<T> = std::result::Result<T, BucketgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_error_kinds() {
        assert_eq!(
            AdmissionError::StoreUnavailable("timeout".into()).kind(),
            "store_unavailable"
        );
        assert_eq!(
            AdmissionError::serialization("default", "bad json").kind(),
            "serialization"
        );
        assert_eq!(
            AdmissionError::LockContention("default".into()).kind(),
            "lock_contention"
        );
        assert_eq!(
            AdmissionError::ConfigurationMissing("default".into()).kind(),
            "configuration_missing"
        );
    }

    #[test]
    fn test_admission_error_display() {
        let err = AdmissionError::serialization("uploads", "missing field `tokens`");
        assert_eq!(
            err.to_string(),
            "bucket record for 'uploads' is invalid: missing field `tokens`"
        );
    }

    #[test]
    fn test_admission_error_wraps_into_bucketgate_error() {
        let err: BucketgateError = AdmissionError::ConfigurationMissing("x".into()).into();
        assert!(matches!(err, BucketgateError::Admission(_)));
    }
}
