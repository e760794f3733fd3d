//! # Redis Cache Store
//!
//! Redis-backed implementation of the shared store. Commands run through a
//! [`ConnectionManager`], which transparently re-establishes dropped
//! connections. Runtime failures are logged and degrade to neutral defaults;
//! they never propagate into request handling.

use super::OutputCacheStore;
use crate::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use std::time::Duration;
use tracing::{debug, error, info};

/// Returns the counter value if it exists, otherwise initializes it to 1 and
/// returns that. Running as a script makes the read-or-create a single
/// execution unit on the server; the client library loads it once and
/// thereafter references it by SHA1.
const GET_OR_INCR_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= false then
    return current
end

return redis.call('INCR', KEYS[1])
"#;

/// Redis implementation of [`OutputCacheStore`].
pub struct RedisOutputStore {
    connection: ConnectionManager,
    get_or_incr_script: Script,
}

impl RedisOutputStore {
    /// Connect to the Redis server at `url`.
    ///
    /// Connection failures here are configuration errors and are surfaced,
    /// unlike runtime failures which degrade silently.
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Self::from_client(client).await
    }

    /// Build the store from an existing client.
    pub async fn from_client(client: Client) -> Result<Self> {
        let connection = ConnectionManager::new(client).await?;
        info!("Redis output cache store connected");

        Ok(Self {
            connection,
            get_or_incr_script: Script::new(GET_OR_INCR_SCRIPT),
        })
    }

    async fn try_get(&self, key: &str) -> RedisResult<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        conn.get(key).await
    }

    async fn try_set(&self, key: &str, value: &[u8], ttl: Duration) -> RedisResult<()> {
        let mut conn = self.connection.clone();
        conn.set_ex(key, value, ttl.as_secs()).await
    }

    async fn try_exists(&self, key: &str) -> RedisResult<bool> {
        let mut conn = self.connection.clone();
        conn.exists(key).await
    }

    async fn try_delete(&self, keys: &[String]) -> RedisResult<i64> {
        let mut conn = self.connection.clone();
        conn.del(keys.to_vec()).await
    }

    async fn try_set_add(&self, key: &str, member: &str) -> RedisResult<i64> {
        let mut conn = self.connection.clone();
        conn.sadd(key, member).await
    }

    async fn try_incr(&self, key: &str) -> RedisResult<i64> {
        let mut conn = self.connection.clone();
        conn.incr(key, 1i64).await
    }

    async fn try_get_or_incr(&self, key: &str) -> RedisResult<i64> {
        let mut conn = self.connection.clone();
        self.get_or_incr_script.key(key).invoke_async(&mut conn).await
    }

    async fn try_publish(&self, channel: &str, message: &str) -> RedisResult<i64> {
        let mut conn = self.connection.clone();
        conn.publish(channel, message).await
    }
}

#[async_trait]
impl OutputCacheStore for RedisOutputStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) => {
                error!("Redis GET failed for key {}: {}", key, e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        if value.is_empty() {
            debug!("Refusing to store empty value for key {}", key);
            return false;
        }

        if ttl.as_secs() == 0 {
            // SETEX rejects a zero expiry; the entry would be dead on arrival anyway.
            debug!("Refusing to store already-expired value for key {}", key);
            return false;
        }

        match self.try_set(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                error!("Redis SETEX failed for key {}: {}", key, e);
                false
            }
        }
    }

    async fn exists(&self, key: &str) -> bool {
        match self.try_exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                error!("Redis EXISTS failed for key {}: {}", key, e);
                false
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> i64 {
        if keys.is_empty() {
            return 0;
        }

        match self.try_delete(keys).await {
            Ok(count) => count,
            Err(e) => {
                error!("Redis DEL failed for {} keys: {}", keys.len(), e);
                0
            }
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> bool {
        match self.try_set_add(key, member).await {
            Ok(added) => added > 0,
            Err(e) => {
                error!("Redis SADD failed for key {}: {}", key, e);
                false
            }
        }
    }

    async fn incr(&self, key: &str) -> i64 {
        match self.try_incr(key).await {
            Ok(value) => value,
            Err(e) => {
                error!("Redis INCR failed for key {}: {}", key, e);
                0
            }
        }
    }

    async fn get_or_incr(&self, key: &str) -> i64 {
        match self.try_get_or_incr(key).await {
            Ok(value) => value,
            Err(e) => {
                error!("Redis get-or-incr script failed for key {}: {}", key, e);
                0
            }
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> i64 {
        match self.try_publish(channel, message).await {
            Ok(receivers) => receivers,
            Err(e) => {
                error!(
                    "Redis PUBLISH failed for channel {} and message {}: {}",
                    channel, message, e
                );
                0
            }
        }
    }
}
