//! Configuration management for Bucketgate.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BucketgateError, Result};
use crate::ratelimit::{BucketSpec, Strategy};

/// Prefix for environment variable overrides, e.g.
/// `BUCKETGATE__STORE__URL=redis://cache:6379/3`.
const ENV_PREFIX: &str = "BUCKETGATE";

/// Main configuration for the Bucketgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Coordination store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP gate address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Coordination store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix prepended to every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store round trip, in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Expiry of a bucket lock (locked strategy), in milliseconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,

    /// Connection establishment timeout, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl StoreConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            call_timeout_ms: default_call_timeout(),
            lock_ttl_ms: default_lock_ttl(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Store round trips a locked check makes before its write lands:
/// `try_lock`, `get` and `set`.
const LOCKED_ROUND_TRIPS: u64 = 3;

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/3".to_string()
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_call_timeout() -> u64 {
    50
}

fn default_lock_ttl() -> u64 {
    200
}

fn default_connect_timeout() -> u64 {
    2000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Concurrency strategy used by the admission evaluator
    #[serde(default)]
    pub strategy: Strategy,

    /// Bucket applied to any request no location claims
    #[serde(default = "default_bucket")]
    pub default: BucketSpec,

    /// Additional named buckets, optionally bound to route prefixes
    #[serde(default)]
    pub locations: Vec<BucketSpec>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            default: default_bucket(),
            locations: Vec::new(),
        }
    }
}

fn default_bucket() -> BucketSpec {
    BucketSpec::new("default", 10, Duration::from_secs(1))
}

impl RateLimitingConfig {
    /// All declared buckets, default first.
    pub fn buckets(&self) -> impl Iterator<Item = &BucketSpec> {
        std::iter::once(&self.default).chain(self.locations.iter())
    }
}

impl BucketgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| BucketgateError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, layered with environment overrides.
    ///
    /// Keys map as `BUCKETGATE__SERVER__LISTEN_ADDR` -> `server.listen_addr`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        let config: BucketgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Reject bucket declarations the limiter cannot run.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in self.rate_limiting.buckets() {
            spec.validate()?;
            if !seen.insert(spec.name.as_str()) {
                return Err(BucketgateError::Config(format!(
                    "bucket '{}' is declared more than once",
                    spec.name
                )));
            }
        }

        if self.store.call_timeout_ms == 0 {
            return Err(BucketgateError::Config(
                "store.call_timeout_ms must be positive".to_string(),
            ));
        }
        if self.store.lock_ttl_ms == 0 {
            return Err(BucketgateError::Config(
                "store.lock_ttl_ms must be positive".to_string(),
            ));
        }
        // A locked check makes three bounded round trips while holding the lock.
        let hold_ms = self.store.call_timeout_ms.saturating_mul(LOCKED_ROUND_TRIPS);
        if self.store.lock_ttl_ms <= hold_ms {
            return Err(BucketgateError::Config(format!(
                "store.lock_ttl_ms ({}) must exceed {} x store.call_timeout_ms ({})",
                self.store.lock_ttl_ms, LOCKED_ROUND_TRIPS, hold_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
server:
  listen_addr: 0.0.0.0:9000
store:
  url: redis://cache:6379/3
  call_timeout_ms: 25
rate_limiting:
  strategy: locked
  default:
    name: local
    capacity: 20
    fill_rate_ms: 500
  locations:
    - name: uploads
      capacity: 5
      fill_rate_ms: 2000
      routes: ["/photos", "/luggage/photo"]
"#;

    #[test]
    fn test_defaults() {
        let config = BucketgateConfig::default();
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.store.key_prefix, "ratelimit:");
        assert_eq!(config.store.call_timeout(), Duration::from_millis(50));
        assert_eq!(config.store.lock_ttl(), Duration::from_millis(200));
        assert_eq!(config.rate_limiting.strategy, Strategy::Atomic);
        assert_eq!(config.rate_limiting.default.name, "default");
        assert_eq!(config.rate_limiting.default.capacity, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let config = BucketgateConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.store.url, "redis://cache:6379/3");
        assert_eq!(config.store.call_timeout_ms, 25);
        assert_eq!(config.store.lock_ttl_ms, 200);
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limiting.strategy, Strategy::Locked);

        let names: Vec<&str> = config.rate_limiting.buckets().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["local", "uploads"]);
        assert_eq!(
            config.rate_limiting.locations[0].fill_rate(),
            Duration::from_secs(2)
        );
        assert_eq!(config.rate_limiting.locations[0].routes.len(), 2);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = BucketgateConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.rate_limiting.default.name, "local");
    }

    #[test]
    fn test_load_layers_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = BucketgateConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.rate_limiting.default.capacity, 20);
        assert_eq!(config.rate_limiting.locations[0].name, "uploads");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let result = BucketgateConfig::from_yaml("rate_limiting: [not, a, map]");
        assert!(matches!(result, Err(BucketgateError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = BucketgateConfig::default();
        config
            .rate_limiting
            .locations
            .push(BucketSpec::new("default", 5, Duration::from_secs(1)));

        assert!(matches!(config.validate(), Err(BucketgateError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = BucketgateConfig::default();
        config.rate_limiting.default.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = BucketgateConfig::default();
        config.store.call_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_lock_ttl_shorter_than_hold_time() {
        let mut config = BucketgateConfig::default();
        config.store.call_timeout_ms = 1000;
        config.store.lock_ttl_ms = 50;
        assert!(matches!(config.validate(), Err(BucketgateError::Config(_))));

        // Three full round trips fit exactly, which still leaves no margin.
        config.store.lock_ttl_ms = 3000;
        assert!(config.validate().is_err());

        config.store.lock_ttl_ms = 3001;
        assert!(config.validate().is_ok());
    }
}
