use super::keys::QueueKeys;
use super::queue::{load_properties, update_properties};
use super::RedisHandle;
use crate::error::Result;
use crate::queue::{Operation, QueueParams, RateLimit};

/// Manages per-queue rate limits, and takes tokens from the current
/// window on behalf of consumers.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    redis: RedisHandle,
}

impl RateLimiter {
    #[must_use]
    pub fn new(redis: RedisHandle) -> Self { Self { redis } }

    #[tracing::instrument(skip(self))]
    pub async fn set(&self, queue: &QueueParams, rate_limit: RateLimit) -> Result<()> {
        let rate_limit = RateLimit::new(rate_limit.limit, rate_limit.interval)?;
        let encoded = serde_json::to_string(&rate_limit)?;
        update_properties(&self.redis, queue, Operation::RateLimit, "set rate limit", |_| {
            Some(("rate_limit", encoded.clone()))
        })
        .await?;
        tracing::info!(%queue, limit = rate_limit.limit, interval = rate_limit.interval, "rate limit set");
        Ok(())
    }

    pub async fn get(&self, queue: &QueueParams) -> Result<Option<RateLimit>> {
        let mut conn = self.redis.shared().await?;
        Ok(load_properties(&mut conn, queue).await?.rate_limit)
    }

    /// Removes the rate limit; returns whether there was one.
    #[tracing::instrument(skip(self))]
    pub async fn clear(&self, queue: &QueueParams) -> Result<bool> {
        let previous = update_properties(&self.redis, queue, Operation::RateLimit, "clear rate limit", |_| None)
            .await?;
        Ok(previous.rate_limit.is_some())
    }

    /// Takes one token from the window containing `now`.  Returns
    /// `false` when the window is exhausted; the caller waits for
    /// [`RateLimit::until_next_window`] and tries again.
    pub(crate) async fn acquire(
        &self,
        queue: &QueueParams,
        rate_limit: &RateLimit,
        now: i64,
    ) -> Result<bool> {
        let key = QueueKeys::new(queue).rate_limit_window(rate_limit.window(now));
        let mut conn = self.redis.shared().await?;
        let granted: i64 = self
            .redis
            .scripts()
            .rate_limit
            .key(key)
            .arg(rate_limit.limit)
            .arg(rate_limit.interval)
            .invoke_async(&mut *conn)
            .await?;
        Ok(granted == 1)
    }
}
