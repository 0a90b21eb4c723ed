use super::scripts::Scripts;
use crate::config::Config;
use crate::error::{Error, Result};
use bb8_redis::RedisConnectionManager;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub(crate) type SharedConnection<'a> = bb8::PooledConnection<'a, RedisConnectionManager>;

/// The handle to the store, shared by producers, consumers, and
/// workers.
///
/// Connections come in two kinds.  Shared connections are pooled and
/// held only for the duration of a single operation; exclusive
/// connections belong to one owner for their whole life, which is
/// what a blocking dequeue needs.  The pool is built on first use;
/// concurrent first callers wait for the same construction.
#[derive(Clone)]
pub struct RedisHandle {
    inner: Arc<Inner>,
}

struct Inner {
    client: redis::Client,
    pool: OnceCell<bb8::Pool<RedisConnectionManager>>,
    config: Config,
    scripts: Scripts,
}

impl RedisHandle {
    /// Creates a handle.  This does not connect yet.
    pub fn new(config: Config) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                pool: OnceCell::new(),
                config,
                scripts: Scripts::new(),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config { &self.inner.config }

    pub(crate) fn scripts(&self) -> &Scripts { &self.inner.scripts }

    async fn pool(&self) -> Result<&bb8::Pool<RedisConnectionManager>> {
        self.inner
            .pool
            .get_or_try_init(|| async {
                let manager = RedisConnectionManager::new(self.inner.config.redis_url.as_str())?;
                let pool = bb8::Pool::builder()
                    .max_size(self.inner.config.pool_size)
                    .idle_timeout(Some(self.inner.config.pool_idle_timeout))
                    .build(manager)
                    .await?;
                Ok::<_, Error>(pool)
            })
            .await
    }

    /// A pooled connection, returned to the pool on drop.
    pub(crate) async fn shared(&self) -> Result<SharedConnection<'_>> {
        self.pool()
            .await?
            .get()
            .await
            .map_err(|source| Error::Connection { source })
    }

    /// A connection owned by the caller alone.
    pub(crate) async fn exclusive(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.inner.client.get_multiplexed_async_connection().await?)
    }
}

impl std::fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHandle")
            .field("redis_url", &self.inner.config.redis_url)
            .field("pool_initialized", &self.inner.pool.initialized())
            .finish_non_exhaustive()
    }
}
