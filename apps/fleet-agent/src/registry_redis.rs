use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use fleet_sdk::session::{RegistryError, SessionRecord, SessionRegistry};
use once_cell::sync::Lazy;
use tracing::warn;

use crate::redis_store::RedisHandle;

/// Rewrites only `lastActivity`, leaving concurrent state changes intact.
static TOUCH: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local raw = redis.call("GET", KEYS[1])
if not raw then
  return 0
end
local rec = cjson.decode(raw)
if ARGV[1] == "" then
  rec["lastActivity"] = nil
else
  rec["lastActivity"] = ARGV[1]
end
redis.call("SET", KEYS[1], cjson.encode(rec))
return 1
"#,
    )
});

/// Session records as JSON strings, indexed per scope by a set of ids.
pub struct RedisSessionRegistry {
    redis: Arc<RedisHandle>,
}

impl RedisSessionRegistry {
    pub fn new(redis: Arc<RedisHandle>) -> Self {
        Self { redis }
    }

    fn index_key(scope: &str) -> String {
        format!("fleet:sessions:{scope}")
    }

    fn record_key(scope: &str, session_id: &str) -> String {
        format!("fleet:sessions:{scope}:{session_id}")
    }

    async fn conn(&self) -> Result<redis::aio::ConnectionManager, RegistryError> {
        self.redis.conn().await.map_err(store)
    }
}

fn store(err: impl std::fmt::Display) -> RegistryError {
    RegistryError::Store(err.to_string())
}

#[async_trait]
impl SessionRegistry for RedisSessionRegistry {
    async fn get_session(
        &self,
        scope: &str,
        session_id: &str,
    ) -> Result<SessionRecord, RegistryError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::record_key(scope, session_id))
            .query_async(&mut conn)
            .await
            .map_err(store)?;
        let raw = raw.ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        serde_json::from_str(&raw).map_err(store)
    }

    async fn update_session_status(
        &self,
        scope: &str,
        session: &SessionRecord,
    ) -> Result<(), RegistryError> {
        let mut conn = self.conn().await?;
        let last_activity = session
            .last_activity
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            .unwrap_or_default();
        let touched: i64 = TOUCH
            .key(Self::record_key(scope, &session.session_id))
            .arg(last_activity)
            .invoke_async(&mut conn)
            .await
            .map_err(store)?;
        if touched == 0 {
            return Err(RegistryError::NotFound(session.session_id.clone()));
        }
        Ok(())
    }

    async fn update_session(
        &self,
        scope: &str,
        session: &SessionRecord,
    ) -> Result<(), RegistryError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(session).map_err(store)?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(Self::record_key(scope, &session.session_id))
            .arg(payload)
            .ignore()
            .cmd("SADD")
            .arg(Self::index_key(scope))
            .arg(&session.session_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store)?;
        Ok(())
    }

    async fn list_sessions(&self, scope: &str) -> Result<Vec<SessionRecord>, RegistryError> {
        let mut conn = self.conn().await?;
        let mut ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::index_key(scope))
            .query_async(&mut conn)
            .await
            .map_err(store)?;
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = redis::cmd("GET")
                .arg(Self::record_key(scope, &id))
                .query_async(&mut conn)
                .await
                .map_err(store)?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) => out.push(record),
                Err(err) => warn!(error = %err, session_id = %id, "skipping undecodable session"),
            }
        }
        Ok(out)
    }
}
