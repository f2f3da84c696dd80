use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::lock::{LaneLock, DEFAULT_LANE_TTL};

// Delete the key only while it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lane lock shared by every process pointing at the same Redis.
///
/// Lanes are `SET NX EX` keys holding a per-instance token, so a crashed
/// holder frees its lanes after the TTL.
pub struct RedisLaneLock {
    client: redis::Client,
    prefix: String,
    token: String,
    ttl: Duration,
}

impl RedisLaneLock {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            token: uuid::Uuid::new_v4().to_string(),
            ttl: DEFAULT_LANE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn lane_key(&self, lane: &str) -> String {
        format!("{}:lane:{}", self.prefix, lane)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StorageError> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }
}

#[async_trait]
impl LaneLock for RedisLaneLock {
    async fn try_acquire(&self, lane: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lane_key(lane))
            .arg(&self.token)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Ok(reply.is_some())
    }

    async fn release(&self, lane: &str) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.lane_key(lane))
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Ok(())
    }
}
