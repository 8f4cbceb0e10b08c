//! Shared storage utilities for rule and telemetry backends

#[cfg(feature = "redis-storage")]
use std::sync::Arc;

#[cfg(feature = "redis-storage")]
use redis::Client as RedisClient;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Shared Redis client wrapper for reuse across the rule and telemetry stores
#[cfg(feature = "redis-storage")]
#[derive(Clone)]
pub struct SharedRedisClient {
    client: Arc<RedisClient>,
}

#[cfg(feature = "redis-storage")]
impl SharedRedisClient {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client =
            RedisClient::open(redis_url).map_err(|e| StorageError::Redis(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Redis(e.to_string()))
    }
}
