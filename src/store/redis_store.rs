//! Redis-backed bucket store for multi-process deployments.
//!
//! Records live at `{prefix}{name}` as JSON strings; the lock for a bucket
//! lives at `{prefix}{name}:lock` and holds the owner's token. The atomic
//! strategy runs [`ADMIT_SCRIPT`] inside Redis, which executes scripts one
//! at a time, so no other command on the key interleaves with it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::{AtomicOutcome, BucketStore};
use crate::config::StoreConfig;
use crate::error::{AdmissionError, BucketgateError, Result};

/// Refill, decide, and consume in one step.
///
/// Returns `{allowed, tokens}`; `allowed` is `-1` when the record is missing
/// and `-2` when it is corrupt. Arithmetic matches `Bucket::admit`: the
/// timestamp advances on every check and never moves backwards.
pub const ADMIT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return {-1, 0}
end
local ok, bucket = pcall(cjson.decode, raw)
if not ok or type(bucket) ~= 'table' then
  return {-2, 0}
end
local capacity = tonumber(bucket.capacity)
local fill_rate = tonumber(bucket.fill_rate)
local tokens = tonumber(bucket.tokens)
local last = tonumber(bucket.last_fill_time)
if not capacity or not fill_rate or not tokens or not last
   or capacity <= 0 or fill_rate <= 0 or tokens < 0 then
  return {-2, 0}
end
local now = tonumber(ARGV[1])
tokens = math.min(tokens, capacity)
if now > last then
  tokens = math.min(capacity, tokens + math.floor((now - last) / fill_rate))
  last = now
end
local allowed = 0
if tokens > 0 then
  tokens = tokens - 1
  allowed = 1
end
bucket.tokens = tokens
bucket.last_fill_time = last
redis.call('SET', KEYS[1], cjson.encode(bucket))
return {allowed, tokens}
"#;

/// Delete the lock only if it still carries the caller's token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const STATUS_MISSING: i64 = -1;
const STATUS_CORRUPT: i64 = -2;

/// Bucket store backed by a shared Redis instance.
#[derive(Clone)]
pub struct RedisBucketStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    admit_script: Script,
    unlock_script: Script,
}

impl RedisBucketStore {
    /// Wrap an established connection.
    pub fn new(conn: MultiplexedConnection, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            admit_script: Script::new(ADMIT_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        }
    }

    /// Open a multiplexed connection using the store configuration.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = tokio::time::timeout(
            config.connect_timeout(),
            client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| {
            BucketgateError::Admission(AdmissionError::StoreUnavailable(format!(
                "connecting to {} timed out after {:?}",
                config.url,
                config.connect_timeout()
            )))
        })??;

        info!(url = %config.url, key_prefix = %config.key_prefix, "Connected to bucket store");
        Ok(Self::new(conn, config.key_prefix.clone()))
    }

    fn bucket_key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}{}:lock", self.key_prefix, name)
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn get(&self, name: &str) -> std::result::Result<Option<Vec<u8>>, AdmissionError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(self.bucket_key(name)).await?;
        Ok(raw)
    }

    async fn set(&self, name: &str, value: &[u8]) -> std::result::Result<(), AdmissionError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.bucket_key(name), value).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> std::result::Result<(), AdmissionError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.bucket_key(name)).await?;
        Ok(())
    }

    async fn try_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> std::result::Result<bool, AdmissionError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn unlock(&self, name: &str, token: &str) -> std::result::Result<(), AdmissionError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .unlock_script
            .key(self.lock_key(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            debug!(bucket = %name, "Lock already expired or taken over before unlock");
        }
        Ok(())
    }

    async fn eval_atomic(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<AtomicOutcome, AdmissionError> {
        let mut conn = self.conn.clone();
        let (status, tokens): (i64, i64) = self
            .admit_script
            .key(self.bucket_key(name))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match status {
            STATUS_MISSING => Err(AdmissionError::ConfigurationMissing(name.to_string())),
            STATUS_CORRUPT => Err(AdmissionError::serialization(
                name,
                "record rejected by admission script",
            )),
            _ => Ok(AtomicOutcome {
                allowed: status == 1,
                tokens_remaining: u64::try_from(tokens).unwrap_or(0),
            }),
        }
    }
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}
