use redis::aio::ConnectionManager;
use redis::RedisResult;
use tokio::sync::OnceCell;

/// Lazily connected redis client shared by the redis-backed adapters.
///
/// The URL is validated on construction; the first command establishes the
/// connection manager, which reconnects on its own afterwards.
pub struct RedisHandle {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisHandle {
    pub fn open(url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    pub async fn conn(&self) -> RedisResult<ConnectionManager> {
        self.conn
            .get_or_try_init(|| self.client.get_connection_manager())
            .await
            .cloned()
    }
}

pub(crate) fn to_redis_err(err: impl std::error::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", err.to_string()))
}
