use std::sync::Arc;

use deadpool_redis::{Config, Pool, Runtime};
use futures::future::BoxFuture;
use log::debug;
use redis::AsyncCommands;
use thiserror::Error;

use crate::classifier::ActivityReport;

pub const STORE_QUEUE_KEY: &str = "atlas:pgcr:store";
pub const BLOCKED_QUEUE_KEY: &str = "atlas:pgcr:blocked";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Hands resolved reports to the downstream store. Failures are retryable.
pub trait Publisher: Send + Sync {
    fn publish<'a>(&'a self, report: &'a ActivityReport) -> BoxFuture<'a, Result<(), QueueError>>;
}

impl<T> Publisher for Arc<T>
where
    T: Publisher + ?Sized,
{
    fn publish<'a>(&'a self, report: &'a ActivityReport) -> BoxFuture<'a, Result<(), QueueError>> {
        (**self).publish(report)
    }
}

/// Holds ids that upstream refused for privacy reasons, for a slower out-of-band retry.
pub trait BlockedQueue: Send + Sync {
    fn push_blocked<'a>(&'a self, instance_id: i64) -> BoxFuture<'a, Result<(), QueueError>>;
}

impl<T> BlockedQueue for Arc<T>
where
    T: BlockedQueue + ?Sized,
{
    fn push_blocked<'a>(&'a self, instance_id: i64) -> BoxFuture<'a, Result<(), QueueError>> {
        (**self).push_blocked(instance_id)
    }
}

/// Redis list queues: JSON reports on one key, bare ids on another.
pub struct RedisQueues {
    pool: Pool,
    store_key: String,
    blocked_key: String,
}

impl RedisQueues {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Config(e.to_string()))?;

        Ok(Self {
            pool,
            store_key: STORE_QUEUE_KEY.to_owned(),
            blocked_key: BLOCKED_QUEUE_KEY.to_owned(),
        })
    }

    async fn push(&self, key: &str, value: String) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        conn.lpush::<_, _, ()>(key, value).await?;
        debug!("pushed to {key}");
        Ok(())
    }
}

impl Publisher for RedisQueues {
    fn publish<'a>(&'a self, report: &'a ActivityReport) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            let payload = serde_json::to_string(report)?;
            self.push(&self.store_key, payload).await
        })
    }
}

impl BlockedQueue for RedisQueues {
    fn push_blocked<'a>(&'a self, instance_id: i64) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(self.push(&self.blocked_key, instance_id.to_string()))
    }
}
