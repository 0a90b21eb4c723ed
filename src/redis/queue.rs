use super::keys::{self, global, QueueKeys};
use super::scripts::decode_reply;
use super::transaction::{self, MAX_ATTEMPTS};
use super::RedisHandle;
use crate::error::{Error, Result};
use crate::queue::{
    DeliveryModel, MessageSet, Operation, QueueParams, QueueProperties, QueueState, QueueType,
};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;

/// Creates, inspects, and removes queues.
#[derive(Debug, Clone)]
pub struct QueueManager {
    redis: RedisHandle,
}

impl QueueManager {
    #[must_use]
    pub fn new(redis: RedisHandle) -> Self { Self { redis } }

    /// Creates a queue.  Saving a queue that already exists with the
    /// same type and delivery model succeeds without changing it;
    /// returns whether the queue was created.
    #[tracing::instrument(skip(self))]
    pub async fn save(
        &self,
        queue: &QueueParams,
        queue_type: QueueType,
        delivery_model: DeliveryModel,
    ) -> Result<bool> {
        let keys = QueueKeys::new(queue);
        let properties = QueueProperties {
            queue_type,
            delivery_model,
            state: QueueState::Active,
            rate_limit: None,
            created_at: super::now(),
        };
        let fields = super::scripts::encode_fields(&properties.to_fields()?)?;

        let mut conn = self.redis.shared().await?;
        let (code, existing_type, existing_model): (i64, String, String) = self
            .redis
            .scripts()
            .save_queue
            .key(keys.properties())
            .key(keys::namespace_queues(&queue.namespace))
            .key(global::NAMESPACES)
            .arg(queue_type.as_str())
            .arg(delivery_model.as_str())
            .arg(fields)
            .arg(&queue.name)
            .arg(&queue.namespace)
            .invoke_async(&mut *conn)
            .await?;

        match code {
            1 => {
                tracing::info!(%queue, %queue_type, %delivery_model, "queue created");
                Ok(true)
            }
            0 => Ok(false),
            _ => Err(Error::QueueExists {
                queue: queue.clone(),
                queue_type: decode_reply("save_queue", &existing_type)?,
                delivery_model: decode_reply("save_queue", &existing_model)?,
            }),
        }
    }

    pub async fn exists(&self, queue: &QueueParams) -> Result<bool> {
        let mut conn = self.redis.shared().await?;
        Ok(conn.exists(QueueKeys::new(queue).properties()).await?)
    }

    pub async fn get_properties(&self, queue: &QueueParams) -> Result<QueueProperties> {
        let mut conn = self.redis.shared().await?;
        load_properties(&mut conn, queue).await
    }

    /// Changes the operational state of a queue.  Always permitted,
    /// so a locked queue can be unlocked.
    #[tracing::instrument(skip(self))]
    pub async fn set_state(&self, queue: &QueueParams, state: QueueState) -> Result<()> {
        update_properties(&self.redis, queue, Operation::SetState, "set queue state", |_| {
            Some(("state", state.as_str().to_owned()))
        })
        .await?;
        tracing::info!(%queue, %state, "queue state changed");
        Ok(())
    }

    /// The queues of a namespace, or of every namespace.
    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<QueueParams>> {
        let mut conn = self.redis.shared().await?;
        let namespaces = match namespace {
            Some(namespace) => vec![namespace.to_owned()],
            None => conn.smembers(global::NAMESPACES).await?,
        };

        let mut queues = Vec::new();
        for namespace in namespaces {
            let names: Vec<String> = conn.smembers(keys::namespace_queues(&namespace)).await?;
            for name in names {
                queues.push(QueueParams::new(&namespace, &name)?);
            }
        }
        queues.sort();
        Ok(queues)
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        let mut conn = self.redis.shared().await?;
        let mut namespaces: Vec<String> = conn.smembers(global::NAMESPACES).await?;
        namespaces.sort();
        Ok(namespaces)
    }

    /// Deletes a queue and every message it holds, audit records
    /// included.  Fails while messages are pending, consumers are
    /// registered, or the queue is bound to an exchange.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, queue: &QueueParams) -> Result<()> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.shared().await?;
        let conn = &mut *conn;
        let namespace_queues = keys::namespace_queues(&queue.namespace);
        let namespace_exchanges = keys::namespace_exchanges(&queue.namespace);

        for _ in 0..MAX_ATTEMPTS {
            transaction::watch(
                conn,
                &[
                    keys.properties(),
                    keys.pending(None),
                    keys.groups(),
                    keys.consumers(),
                    keys.exchanges(),
                    keys.messages(),
                    keys.scheduled(),
                    keys.delayed(),
                    namespace_queues.clone(),
                    namespace_exchanges.clone(),
                ],
            )
            .await?;

            let properties = match load_properties(conn, queue).await {
                Ok(properties) => properties,
                Err(error) => return transaction::abort(conn, error).await,
            };
            if let Err(error) = properties.check(queue, Operation::Delete) {
                return transaction::abort(conn, error).await;
            }

            let groups: Vec<String> = conn.smembers(keys.groups()).await?;
            let pending_keys = pending_keys(&keys, &properties, &groups);
            if pending_size(conn, properties.queue_type, &pending_keys).await? > 0 {
                return transaction::abort(conn, Error::QueueNotEmpty { queue: queue.clone() }).await;
            }
            let consumers: u64 = conn.scard(keys.consumers()).await?;
            if consumers > 0 {
                let error = Error::QueueHasConsumers {
                    queue: queue.clone(),
                    consumers,
                };
                return transaction::abort(conn, error).await;
            }
            let exchanges: u64 = conn.scard(keys.exchanges()).await?;
            if exchanges > 0 {
                let error = Error::QueueBoundToExchange { queue: queue.clone() };
                return transaction::abort(conn, error).await;
            }

            let messages: Vec<String> = conn.smembers(keys.messages()).await?;
            let scheduled: Vec<String> = conn.smembers(keys.scheduled()).await?;
            let delayed: Vec<String> = conn.smembers(keys.delayed()).await?;
            let remaining_queues: u64 = conn.scard(&namespace_queues).await?;
            let remaining_exchanges: u64 = conn.scard(&namespace_exchanges).await?;

            let mut pipe = redis::pipe();
            for id in &messages {
                pipe.del(format!("{}{id}", global::MESSAGE_PREFIX)).ignore();
            }
            if !scheduled.is_empty() {
                pipe.zrem(global::SCHEDULED, &scheduled).ignore();
            }
            if !delayed.is_empty() {
                pipe.zrem(global::DELAYED, &delayed).ignore();
            }
            let mut owned = vec![
                keys.properties(),
                keys.pending(None),
                keys.groups(),
                keys.ephemeral_groups(),
                keys.consumers(),
                keys.acknowledged(),
                keys.dead_lettered(),
                keys.scheduled(),
                keys.delayed(),
                keys.messages(),
                keys.exchanges(),
            ];
            owned.extend(groups.iter().map(|group| keys.pending(Some(group))));
            pipe.del(owned).ignore();
            pipe.srem(&namespace_queues, &queue.name).ignore();
            if remaining_queues <= 1 && remaining_exchanges == 0 {
                pipe.srem(global::NAMESPACES, &queue.namespace).ignore();
            }

            if transaction::commit(conn, &mut pipe).await? {
                tracing::info!(%queue, messages = messages.len(), "queue deleted");
                return Ok(());
            }
        }

        Err(transaction::conflict("delete queue"))
    }

    /// Deletes every message in one of the queue's structures;
    /// returns the number of messages deleted.  Purging the pending
    /// messages of a pub/sub queue without naming a group purges
    /// every group.  Messages being processed are never touched.
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self, queue: &QueueParams, set: MessageSet) -> Result<u64> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.shared().await?;
        let properties = load_properties(&mut conn, queue).await?;
        properties.check(queue, Operation::Purge)?;

        let targets: Vec<(String, &str, Option<&str>)> = match &set {
            MessageSet::Pending { group } => {
                let kind = if properties.queue_type.is_priority() {
                    "zset"
                } else {
                    "list"
                };
                let groups = match group {
                    Some(group) => vec![group.clone()],
                    None => conn.smembers(keys.groups()).await?,
                };
                pending_keys(&keys, &properties, &groups)
                    .into_iter()
                    .map(|key| (key, kind, None))
                    .collect()
            }
            MessageSet::Acknowledged => vec![(keys.acknowledged(), "zset", None)],
            MessageSet::DeadLettered => vec![(keys.dead_lettered(), "zset", None)],
            MessageSet::Scheduled => vec![(keys.scheduled(), "set", Some(global::SCHEDULED))],
            MessageSet::Delayed => vec![(keys.delayed(), "set", Some(global::DELAYED))],
        };

        let mut purged = 0;
        for (key, kind, mirror) in targets {
            let mut invocation = self.redis.scripts().purge.prepare_invoke();
            invocation.key(key).key(keys.messages());
            if let Some(mirror) = mirror {
                invocation.key(mirror);
            }
            let count: u64 = invocation
                .arg(kind)
                .arg(global::MESSAGE_PREFIX)
                .invoke_async(&mut *conn)
                .await?;
            purged += count;
        }

        tracing::info!(%queue, ?set, purged, "queue purged");
        Ok(purged)
    }
}

pub(crate) async fn load_properties(
    conn: &mut MultiplexedConnection,
    queue: &QueueParams,
) -> Result<QueueProperties> {
    let key = QueueKeys::new(queue).properties();
    let raw: HashMap<String, String> = conn.hgetall(&key).await?;
    if raw.is_empty() {
        return Err(Error::QueueNotFound { queue: queue.clone() });
    }
    QueueProperties::from_fields(&key, &raw)
}

/// Writes one property field under `WATCH`, after checking that the
/// queue exists and its state permits `operation`.  `update` sees the
/// current properties and returns the field to set, or `None` to
/// delete the rate limit.
pub(crate) async fn update_properties<F>(
    redis: &RedisHandle,
    queue: &QueueParams,
    operation: Operation,
    name: &'static str,
    update: F,
) -> Result<QueueProperties>
where
    F: Fn(&QueueProperties) -> Option<(&'static str, String)>,
{
    let key = QueueKeys::new(queue).properties();
    let mut conn = redis.shared().await?;
    let conn = &mut *conn;

    for _ in 0..MAX_ATTEMPTS {
        transaction::watch(conn, &[key.clone()]).await?;
        let properties = match load_properties(conn, queue).await {
            Ok(properties) => properties,
            Err(error) => return transaction::abort(conn, error).await,
        };
        if let Err(error) = properties.check(queue, operation) {
            return transaction::abort(conn, error).await;
        }

        let mut pipe = redis::pipe();
        match update(&properties) {
            Some((field, value)) => pipe.hset(&key, field, value).ignore(),
            None => pipe.hdel(&key, "rate_limit").ignore(),
        };
        if transaction::commit(conn, &mut pipe).await? {
            return Ok(properties);
        }
    }

    Err(transaction::conflict(name))
}

/// The pending structures of a queue: the shared one, or one per
/// consumer group.
pub(crate) fn pending_keys(
    keys: &QueueKeys,
    properties: &QueueProperties,
    groups: &[String],
) -> Vec<String> {
    match properties.delivery_model {
        DeliveryModel::PointToPoint => vec![keys.pending(None)],
        DeliveryModel::PubSub => groups.iter().map(|group| keys.pending(Some(group))).collect(),
    }
}

pub(crate) async fn pending_size(
    conn: &mut MultiplexedConnection,
    queue_type: QueueType,
    pending_keys: &[String],
) -> Result<u64> {
    let mut total = 0;
    for key in pending_keys {
        let size: u64 = if queue_type.is_priority() {
            conn.zcard(key).await?
        } else {
            conn.llen(key).await?
        };
        total += size;
    }
    Ok(total)
}
