use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_sdk::lease::{LeaseError, LeaseStore};
use once_cell::sync::Lazy;

use crate::redis_store::RedisHandle;

/// Extends the lease only while `ARGV[1]` still holds it.
static RENEW: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#,
    )
});

/// Compare-and-delete.
static RELEASE: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#,
    )
});

/// Lease held as a single key with a millisecond TTL. Expiry is enforced by
/// redis, so a crashed holder's lease lapses on its own.
pub struct RedisLeaseStore {
    redis: Arc<RedisHandle>,
}

impl RedisLeaseStore {
    pub fn new(redis: Arc<RedisHandle>) -> Self {
        Self { redis }
    }

    fn key(name: &str) -> String {
        format!("fleet:agent:leader:{name}")
    }
}

fn backend(err: redis::RedisError) -> LeaseError {
    LeaseError::Backend(err.to_string())
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let mut conn = self.redis.conn().await.map_err(backend)?;
        let key = Self::key(name);
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        if set.is_some() {
            return Ok(true);
        }
        let refreshed: i64 = RENEW
            .key(&key)
            .arg(holder)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(refreshed == 1)
    }

    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let mut conn = self.redis.conn().await.map_err(backend)?;
        let renewed: i64 = RENEW
            .key(Self::key(name))
            .arg(holder)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(renewed == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, LeaseError> {
        let mut conn = self.redis.conn().await.map_err(backend)?;
        let deleted: i64 = RELEASE
            .key(Self::key(name))
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted == 1)
    }

    async fn current_holder(&self, name: &str) -> Result<Option<String>, LeaseError> {
        let mut conn = self.redis.conn().await.map_err(backend)?;
        let holder: Option<String> = redis::cmd("GET")
            .arg(Self::key(name))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(holder)
    }
}
