use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StorageError;

/// Lock TTL for distributed lanes. Longer than any single delivery attempt.
pub const DEFAULT_LANE_TTL: Duration = Duration::from_secs(5 * 60);

/// Mutual exclusion per delivery lane (one lane per subscription or
/// standalone payload).
///
/// `try_acquire` never waits: a busy lane means another worker already owns
/// the work.
#[async_trait]
pub trait LaneLock: Send + Sync {
    async fn try_acquire(&self, lane: &str) -> Result<bool, StorageError>;
    async fn release(&self, lane: &str) -> Result<(), StorageError>;
}

/// Lanes held by this process.
#[derive(Debug, Default)]
pub struct LocalLaneLock {
    held: Mutex<HashSet<String>>,
}

impl LocalLaneLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_held(&self, lane: &str) -> bool {
        self.held.lock().await.contains(lane)
    }
}

#[async_trait]
impl LaneLock for LocalLaneLock {
    async fn try_acquire(&self, lane: &str) -> Result<bool, StorageError> {
        Ok(self.held.lock().await.insert(lane.to_string()))
    }

    async fn release(&self, lane: &str) -> Result<(), StorageError> {
        self.held.lock().await.remove(lane);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use crate::lock_redis::RedisLaneLock;
