use super::keys::{self, global, ExchangeKeys, QueueKeys};
use super::queue::load_properties;
use super::transaction::{self, MAX_ATTEMPTS};
use super::RedisHandle;
use crate::error::{Error, Result};
use crate::exchange::{Binding, ExchangeKind, ExchangeParams};
use crate::queue::QueueParams;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

const KIND: &str = "kind";

/// Exchanges and their bindings.
///
/// Binding sets have no fixed size, so every mutation here is an
/// optimistic transaction over the keys involved instead of a
/// script.
#[derive(Debug, Clone)]
pub struct Exchanges {
    redis: RedisHandle,
}

impl Exchanges {
    #[must_use]
    pub fn new(redis: RedisHandle) -> Self { Self { redis } }

    /// Creates an exchange.  Saving an existing exchange of the same
    /// kind is a no-op; returns whether the exchange was created.
    #[tracing::instrument(skip(self))]
    pub async fn save(&self, exchange: &ExchangeParams, kind: ExchangeKind) -> Result<bool> {
        let keys = ExchangeKeys::new(exchange);
        let mut conn = self.redis.shared().await?;
        let conn = &mut *conn;

        for _ in 0..MAX_ATTEMPTS {
            transaction::watch(conn, &[keys.properties()]).await?;
            match load_kind(conn, &keys).await? {
                Some(existing) if existing == kind => {
                    redis::cmd("UNWATCH").query_async::<_, ()>(&mut *conn).await?;
                    return Ok(false);
                }
                Some(_) => {
                    let error = Error::ExchangeKindMismatch {
                        exchange: exchange.to_string(),
                    };
                    return transaction::abort(conn, error).await;
                }
                None => {}
            }

            let mut pipe = redis::pipe();
            pipe.hset(keys.properties(), KIND, kind.as_str())
                .ignore()
                .sadd(keys::namespace_exchanges(&exchange.namespace), &exchange.name)
                .ignore()
                .sadd(global::NAMESPACES, &exchange.namespace)
                .ignore();
            if transaction::commit(conn, &mut pipe).await? {
                tracing::info!(%exchange, %kind, "exchange created");
                return Ok(true);
            }
        }

        Err(transaction::conflict("save exchange"))
    }

    /// Deletes an exchange without bindings.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, exchange: &ExchangeParams) -> Result<()> {
        let keys = ExchangeKeys::new(exchange);
        let namespace_exchanges = keys::namespace_exchanges(&exchange.namespace);
        let namespace_queues = keys::namespace_queues(&exchange.namespace);
        let mut conn = self.redis.shared().await?;
        let conn = &mut *conn;

        for _ in 0..MAX_ATTEMPTS {
            transaction::watch(
                conn,
                &[
                    keys.properties(),
                    keys.bindings(),
                    namespace_exchanges.clone(),
                    namespace_queues.clone(),
                ],
            )
            .await?;

            if load_kind(conn, &keys).await?.is_none() {
                let error = Error::ExchangeNotFound {
                    exchange: exchange.to_string(),
                };
                return transaction::abort(conn, error).await;
            }
            let bindings: u64 = conn.scard(keys.bindings()).await?;
            if bindings > 0 {
                let error = Error::ExchangeHasBindings {
                    exchange: exchange.to_string(),
                };
                return transaction::abort(conn, error).await;
            }
            let remaining_exchanges: u64 = conn.scard(&namespace_exchanges).await?;
            let remaining_queues: u64 = conn.scard(&namespace_queues).await?;

            let mut pipe = redis::pipe();
            pipe.del(&[keys.properties(), keys.bindings()][..])
                .ignore()
                .srem(&namespace_exchanges, &exchange.name)
                .ignore();
            if remaining_exchanges <= 1 && remaining_queues == 0 {
                pipe.srem(global::NAMESPACES, &exchange.namespace).ignore();
            }
            if transaction::commit(conn, &mut pipe).await? {
                tracing::info!(%exchange, "exchange deleted");
                return Ok(());
            }
        }

        Err(transaction::conflict("delete exchange"))
    }

    /// Binds `queue` under `key`.  Fan-out exchanges ignore the key;
    /// direct and topic exchanges require one.  Every queue bound to
    /// an exchange must have the same queue type.
    #[tracing::instrument(skip(self))]
    pub async fn bind(&self, exchange: &ExchangeParams, queue: &QueueParams, key: Option<&str>) -> Result<()> {
        let keys = ExchangeKeys::new(exchange);
        let queue_keys = QueueKeys::new(queue);
        let mut conn = self.redis.shared().await?;
        let conn = &mut *conn;

        for _ in 0..MAX_ATTEMPTS {
            transaction::watch(
                conn,
                &[keys.properties(), keys.bindings(), queue_keys.properties()],
            )
            .await?;

            let binding = match check_binding(conn, exchange, &keys, queue, key).await {
                Ok(binding) => binding,
                Err(error) => return transaction::abort(conn, error).await,
            };

            let mut pipe = redis::pipe();
            pipe.sadd(keys.bindings(), binding.encode())
                .ignore()
                .sadd(queue_keys.exchanges(), exchange.to_string())
                .ignore();
            if transaction::commit(conn, &mut pipe).await? {
                tracing::info!(%exchange, %queue, key = %binding.key, "queue bound");
                return Ok(());
            }
        }

        Err(transaction::conflict("bind queue"))
    }

    /// Removes one binding; returns whether it existed.
    #[tracing::instrument(skip(self))]
    pub async fn unbind(&self, exchange: &ExchangeParams, queue: &QueueParams, key: Option<&str>) -> Result<bool> {
        let keys = ExchangeKeys::new(exchange);
        let queue_keys = QueueKeys::new(queue);
        let mut conn = self.redis.shared().await?;
        let conn = &mut *conn;

        for _ in 0..MAX_ATTEMPTS {
            transaction::watch(conn, &[keys.properties(), keys.bindings()]).await?;

            let Some(kind) = load_kind(conn, &keys).await? else {
                let error = Error::ExchangeNotFound {
                    exchange: exchange.to_string(),
                };
                return transaction::abort(conn, error).await;
            };
            let binding = match kind.binding_key(exchange, key) {
                Ok(key) => Binding {
                    key,
                    queue: queue.clone(),
                },
                Err(error) => return transaction::abort(conn, error).await,
            };

            let existing = decode_bindings(conn, &keys).await?;
            let found = existing.contains(&binding);
            let last_for_queue = !existing
                .iter()
                .any(|other| other.queue == *queue && *other != binding);

            let mut pipe = redis::pipe();
            pipe.srem(keys.bindings(), binding.encode()).ignore();
            if last_for_queue {
                pipe.srem(queue_keys.exchanges(), exchange.to_string()).ignore();
            }
            if transaction::commit(conn, &mut pipe).await? {
                if found {
                    tracing::info!(%exchange, %queue, key = %binding.key, "queue unbound");
                }
                return Ok(found);
            }
        }

        Err(transaction::conflict("unbind queue"))
    }

    pub async fn kind(&self, exchange: &ExchangeParams) -> Result<ExchangeKind> {
        let mut conn = self.redis.shared().await?;
        load_kind(&mut conn, &ExchangeKeys::new(exchange))
            .await?
            .ok_or_else(|| Error::ExchangeNotFound {
                exchange: exchange.to_string(),
            })
    }

    pub async fn bound_queues(&self, exchange: &ExchangeParams) -> Result<Vec<Binding>> {
        let keys = ExchangeKeys::new(exchange);
        let mut conn = self.redis.shared().await?;
        if load_kind(&mut conn, &keys).await?.is_none() {
            return Err(Error::ExchangeNotFound {
                exchange: exchange.to_string(),
            });
        }
        decode_bindings(&mut conn, &keys).await
    }

    /// The queues a message published with `routing_key` is delivered
    /// to.
    pub async fn match_queues(
        &self,
        exchange: &ExchangeParams,
        routing_key: Option<&str>,
    ) -> Result<Vec<QueueParams>> {
        let keys = ExchangeKeys::new(exchange);
        let mut conn = self.redis.shared().await?;
        let kind = load_kind(&mut conn, &keys)
            .await?
            .ok_or_else(|| Error::ExchangeNotFound {
                exchange: exchange.to_string(),
            })?;
        if kind != ExchangeKind::FanOut && routing_key.is_none() {
            return Err(Error::RoutingKeyRequired {
                exchange: exchange.to_string(),
            });
        }

        let routing_key = routing_key.map(str::to_ascii_lowercase);
        let mut queues = decode_bindings(&mut conn, &keys)
            .await?
            .into_iter()
            .filter(|binding| kind.matches(&binding.key, routing_key.as_deref()))
            .map(|binding| binding.queue)
            .collect::<Vec<_>>();
        queues.sort();
        queues.dedup();
        Ok(queues)
    }

    pub async fn list(&self, namespace: &str) -> Result<Vec<ExchangeParams>> {
        let mut conn = self.redis.shared().await?;
        let names: Vec<String> = conn.smembers(keys::namespace_exchanges(namespace)).await?;
        let mut exchanges = names
            .iter()
            .map(|name| ExchangeParams::new(namespace, name))
            .collect::<Result<Vec<_>>>()?;
        exchanges.sort();
        Ok(exchanges)
    }
}

async fn check_binding(
    conn: &mut MultiplexedConnection,
    exchange: &ExchangeParams,
    keys: &ExchangeKeys,
    queue: &QueueParams,
    key: Option<&str>,
) -> Result<Binding> {
    let kind = load_kind(conn, keys).await?.ok_or_else(|| Error::ExchangeNotFound {
        exchange: exchange.to_string(),
    })?;
    let properties = load_properties(conn, queue).await?;
    let binding = Binding {
        key: kind.binding_key(exchange, key)?,
        queue: queue.clone(),
    };

    let existing: Vec<String> = conn.smembers(keys.bindings()).await?;
    if let Some(other) = existing
        .iter()
        .map(|encoded| Binding::decode(encoded))
        .find(|other| !matches!(other, Ok(other) if other.queue == *queue))
    {
        let other = other?;
        let other_keys = QueueKeys::new(&other.queue);
        transaction::watch(conn, &[other_keys.properties()]).await?;
        let other_type = load_properties(conn, &other.queue).await?.queue_type;
        if other_type != properties.queue_type {
            return Err(Error::ExchangeQueueTypeMismatch {
                exchange: exchange.to_string(),
                queue: queue.clone(),
            });
        }
    }

    Ok(binding)
}

async fn load_kind(conn: &mut MultiplexedConnection, keys: &ExchangeKeys) -> Result<Option<ExchangeKind>> {
    let kind: Option<String> = conn.hget(keys.properties(), KIND).await?;
    kind.map(|kind| {
        kind.parse().map_err(|reason| Error::Decode {
            key: keys.properties(),
            field: KIND.to_owned(),
            reason,
        })
    })
    .transpose()
}

async fn decode_bindings(conn: &mut MultiplexedConnection, keys: &ExchangeKeys) -> Result<Vec<Binding>> {
    let encoded: Vec<String> = conn.smembers(keys.bindings()).await?;
    let mut bindings = encoded
        .iter()
        .map(|binding| Binding::decode(binding))
        .collect::<Result<Vec<_>>>()?;
    bindings.sort();
    Ok(bindings)
}
