use std::sync::Arc;

use async_trait::async_trait;
use fleet_sdk::command::{
    apply_update, CommandRecord, CommandStore, CommandStoreError, InsertOutcome, StatusUpdate,
};
use once_cell::sync::Lazy;

use crate::redis_store::RedisHandle;

/// Command records outlive any plausible redelivery window.
const RECORD_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const CAS_ATTEMPTS: usize = 5;

/// Replaces the record only if it still matches what the caller read.
static COMPARE_AND_SET: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  redis.call("SET", KEYS[1], ARGV[2], "KEEPTTL")
  return 1
end
return 0
"#,
    )
});

/// Command records as JSON strings under `fleet:commands:{id}`.
pub struct RedisCommandStore {
    redis: Arc<RedisHandle>,
}

impl RedisCommandStore {
    pub fn new(redis: Arc<RedisHandle>) -> Self {
        Self { redis }
    }

    fn key(command_id: &str) -> String {
        format!("fleet:commands:{command_id}")
    }

    async fn conn(&self) -> Result<redis::aio::ConnectionManager, CommandStoreError> {
        self.redis.conn().await.map_err(store)
    }

    async fn read_raw(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        command_id: &str,
    ) -> Result<Option<String>, CommandStoreError> {
        redis::cmd("GET")
            .arg(Self::key(command_id))
            .query_async(conn)
            .await
            .map_err(store)
    }

    /// Optimistic read-modify-write. `mutate` returns `None` to leave the
    /// record untouched.
    async fn update<T>(
        &self,
        command_id: &str,
        mut mutate: impl FnMut(&mut CommandRecord) -> Result<Option<T>, CommandStoreError> + Send,
    ) -> Result<Option<T>, CommandStoreError>
    where
        T: Send,
    {
        let mut conn = self.conn().await?;
        for _ in 0..CAS_ATTEMPTS {
            let raw = self
                .read_raw(&mut conn, command_id)
                .await?
                .ok_or_else(|| CommandStoreError::NotFound(command_id.to_string()))?;
            let mut record: CommandRecord = serde_json::from_str(&raw).map_err(store)?;
            let Some(out) = mutate(&mut record)? else {
                return Ok(None);
            };
            let next = serde_json::to_string(&record).map_err(store)?;
            let swapped: i64 = COMPARE_AND_SET
                .key(Self::key(command_id))
                .arg(&raw)
                .arg(next)
                .invoke_async(&mut conn)
                .await
                .map_err(store)?;
            if swapped == 1 {
                return Ok(Some(out));
            }
        }
        Err(CommandStoreError::Store(format!(
            "contention updating command {command_id}"
        )))
    }
}

fn store(err: impl std::fmt::Display) -> CommandStoreError {
    CommandStoreError::Store(err.to_string())
}

#[async_trait]
impl CommandStore for RedisCommandStore {
    async fn insert_if_absent(
        &self,
        record: CommandRecord,
    ) -> Result<InsertOutcome, CommandStoreError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&record).map_err(store)?;
        let set: Option<String> = redis::cmd("SET")
            .arg(Self::key(&record.command_id))
            .arg(payload)
            .arg("NX")
            .arg("EX")
            .arg(RECORD_TTL_SECS)
            .query_async(&mut conn)
            .await
            .map_err(store)?;
        if set.is_some() {
            return Ok(InsertOutcome::Inserted);
        }
        let raw = self
            .read_raw(&mut conn, &record.command_id)
            .await?
            .ok_or_else(|| store(format!("command {} vanished", record.command_id)))?;
        let existing = serde_json::from_str(&raw).map_err(store)?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn advance(
        &self,
        command_id: &str,
        update: StatusUpdate,
    ) -> Result<CommandRecord, CommandStoreError> {
        let updated = self
            .update(command_id, |record| {
                apply_update(record, update.clone())?;
                Ok(Some(record.clone()))
            })
            .await?;
        updated.ok_or_else(|| CommandStoreError::NotFound(command_id.to_string()))
    }

    async fn mark_reported(&self, command_id: &str) -> Result<bool, CommandStoreError> {
        let first = self
            .update(command_id, |record| {
                if record.reported {
                    return Ok(None);
                }
                record.reported = true;
                Ok(Some(()))
            })
            .await?;
        Ok(first.is_some())
    }

    async fn clear_reported(&self, command_id: &str) -> Result<(), CommandStoreError> {
        self.update(command_id, |record| {
            if !record.reported {
                return Ok(None);
            }
            record.reported = false;
            Ok(Some(()))
        })
        .await?;
        Ok(())
    }

    async fn get(&self, command_id: &str) -> Result<Option<CommandRecord>, CommandStoreError> {
        let mut conn = self.conn().await?;
        match self.read_raw(&mut conn, command_id).await? {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(store),
            None => Ok(None),
        }
    }
}
