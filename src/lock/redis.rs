//! Redis lock backend.
//!
//! Each lock is a plain key holding `{token, metadata}` as JSON, with no TTL.
//! Expirations live in a sorted set scored by expiry time (server clock, ms), so a
//! claim that outlives its expiration stays readable until the next acquirer takes
//! it over and recovers its metadata.
//!
//! Key format:
//! - lock: `{prefix}:pub:{entity_key}`
//! - expiration index: `{prefix}:pub:expirations`

use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use redis::{aio::ConnectionManager, Client, RedisError, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{LockBackend, LockError, LockMetadata, LockOutcome, Result};
use crate::entity::EntityKey;
use crate::utils::retry::connection_backoff;

const NOW_MS: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
";

/// KEYS: lock, index. ARGV: value, expiration_ms.
/// Returns {0, ''} busy, {1, ''} acquired, {2, previous} recovered.
const ACQUIRE: &str = r"
local current = redis.call('GET', KEYS[1])
if current then
  local score = redis.call('ZSCORE', KEYS[2], KEYS[1])
  if score and tonumber(score) > now then
    return {0, ''}
  end
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[2]), KEYS[1])
if current then
  return {2, current}
end
return {1, ''}
";

/// KEYS: lock, index. ARGV: token, expiration_ms.
const EXTEND: &str = r"
local current = redis.call('GET', KEYS[1])
if not current or cjson.decode(current)['token'] ~= ARGV[1] then
  return 0
end
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[2]), KEYS[1])
return 1
";

/// KEYS: lock, index. ARGV: token.
const RELEASE: &str = r"
local current = redis.call('GET', KEYS[1])
if not current or cjson.decode(current)['token'] ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], KEYS[1])
return 1
";

/// KEYS: lock, index. ARGV: token, value. Scores the claim as expired now.
const RELINQUISH: &str = r"
local current = redis.call('GET', KEYS[1])
if not current or cjson.decode(current)['token'] ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], now, KEYS[1])
return 1
";

/// KEYS: index. Returns a flat list of lock key / value pairs.
const EXPIRED: &str = r"
local keys = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
local result = {}
for _, k in ipairs(keys) do
  local v = redis.call('GET', k)
  if v then
    table.insert(result, k)
    table.insert(result, v)
  end
end
return result
";

impl From<RedisError> for LockError {
    fn from(e: RedisError) -> Self {
        LockError::Backend(e.to_string())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredLock {
    token: String,
    metadata: LockMetadata,
}

/// Redis implementation of [`LockBackend`].
pub struct RedisLockBackend {
    conn: ConnectionManager,
    key_prefix: String,
    acquire: Script,
    extend: Script,
    release: Script,
    relinquish: Script,
    expired: Script,
}

impl RedisLockBackend {
    /// Connect to Redis, retrying with backoff until it is reachable.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `key_prefix` - Prefix for all lock keys
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = Client::open(url)?;

        let conn = (|| ConnectionManager::new(client.clone()))
            .retry(connection_backoff())
            .notify(|e: &RedisError, delay: Duration| {
                warn!(url = %url, error = %e, delay = ?delay, "Redis not reachable, retrying");
            })
            .await?;

        info!(url = %url, "Connected to Redis for locks");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            acquire: Script::new(&format!("{NOW_MS}{ACQUIRE}")),
            extend: Script::new(&format!("{NOW_MS}{EXTEND}")),
            release: Script::new(RELEASE),
            relinquish: Script::new(&format!("{NOW_MS}{RELINQUISH}")),
            expired: Script::new(&format!("{NOW_MS}{EXPIRED}")),
        })
    }

    fn lock_key(&self, key: &EntityKey) -> String {
        format!("{}:pub:{}", self.key_prefix, key)
    }

    fn index_key(&self) -> String {
        format!("{}:pub:expirations", self.key_prefix)
    }

    fn entity_key(&self, lock_key: &str) -> Option<EntityKey> {
        lock_key
            .strip_prefix(&format!("{}:pub:", self.key_prefix))
            .map(EntityKey::new)
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(
        &self,
        key: &EntityKey,
        token: &str,
        metadata: &LockMetadata,
        expiration: Duration,
    ) -> Result<LockOutcome> {
        let value = serde_json::to_string(&StoredLock {
            token: token.to_string(),
            metadata: metadata.clone(),
        })?;
        let mut conn = self.conn.clone();

        let (status, previous): (i64, String) = self
            .acquire
            .key(self.lock_key(key))
            .key(self.index_key())
            .arg(value)
            .arg(millis(expiration))
            .invoke_async(&mut conn)
            .await?;

        match status {
            0 => Ok(LockOutcome::Unavailable),
            1 => Ok(LockOutcome::Acquired),
            _ => {
                let stale: StoredLock = serde_json::from_str(&previous)?;
                debug!(key = %key, previous_token = %stale.token, "Took over expired Redis lock");
                Ok(LockOutcome::Recovered(stale.metadata))
            }
        }
    }

    async fn extend(&self, key: &EntityKey, token: &str, expiration: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend
            .key(self.lock_key(key))
            .key(self.index_key())
            .arg(token)
            .arg(millis(expiration))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &EntityKey, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(self.lock_key(key))
            .key(self.index_key())
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn relinquish(&self, key: &EntityKey, token: &str, metadata: &LockMetadata) -> Result<bool> {
        let value = serde_json::to_string(&StoredLock {
            token: token.to_string(),
            metadata: metadata.clone(),
        })?;
        let mut conn = self.conn.clone();
        let relinquished: i64 = self
            .relinquish
            .key(self.lock_key(key))
            .key(self.index_key())
            .arg(token)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(relinquished == 1)
    }

    async fn expired(&self) -> Result<Vec<(EntityKey, LockMetadata)>> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .expired
            .key(self.index_key())
            .invoke_async(&mut conn)
            .await?;

        let mut expired = Vec::with_capacity(flat.len() / 2);
        for pair in flat.chunks_exact(2) {
            let Some(key) = self.entity_key(&pair[0]) else {
                continue;
            };
            match serde_json::from_str::<StoredLock>(&pair[1]) {
                Ok(stored) => expired.push((key, stored.metadata)),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable expired lock"),
            }
        }
        expired.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(expired)
    }
}
