use super::keys::{global, QueueKeys};
use super::queue::{load_properties, pending_size};
use super::transaction::{self, MAX_ATTEMPTS};
use super::RedisHandle;
use crate::error::{Error, Result};
use crate::queue::{validate_name, DeliveryModel, Operation, QueueParams, QueueProperties};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

/// Consumer groups of pub/sub queues.  Every group receives its own
/// copy of each message published after the group was created.
#[derive(Debug, Clone)]
pub struct ConsumerGroups {
    redis: RedisHandle,
}

impl ConsumerGroups {
    #[must_use]
    pub fn new(redis: RedisHandle) -> Self { Self { redis } }

    /// Creates a group; returns whether it did not exist yet.
    #[tracing::instrument(skip(self))]
    pub async fn save(&self, queue: &QueueParams, group: &str) -> Result<bool> {
        let group = validate_name(group)?;
        let mut conn = self.redis.shared().await?;
        let created = save_group(&mut conn, queue, &group, None).await?;
        if created {
            tracing::info!(%queue, %group, "consumer group created");
        }
        Ok(created)
    }

    /// Deletes a group with no pending or delayed messages.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, queue: &QueueParams, group: &str) -> Result<()> {
        let group = validate_name(group)?;
        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.shared().await?;
        let conn = &mut *conn;

        for _ in 0..MAX_ATTEMPTS {
            transaction::watch(
                conn,
                &[keys.properties(), keys.groups(), keys.pending(Some(&group)), keys.delayed()],
            )
            .await?;

            let properties = match checked_properties(conn, queue).await {
                Ok(properties) => properties,
                Err(error) => return transaction::abort(conn, error).await,
            };
            let exists: bool = conn.sismember(keys.groups(), &group).await?;
            if !exists {
                let error = Error::ConsumerGroupNotFound {
                    queue: queue.clone(),
                    group,
                };
                return transaction::abort(conn, error).await;
            }
            let pending = [keys.pending(Some(&group))];
            let waiting = pending_size(conn, properties.queue_type, &pending).await?;
            if waiting > 0 || delayed_in_group(conn, &keys, &group).await? > 0 {
                let error = Error::ConsumerGroupNotEmpty {
                    queue: queue.clone(),
                    group,
                };
                return transaction::abort(conn, error).await;
            }

            let mut pipe = redis::pipe();
            pipe.srem(keys.groups(), &group)
                .ignore()
                .hdel(keys.ephemeral_groups(), &group)
                .ignore()
                .del(&pending[..])
                .ignore();
            if transaction::commit(conn, &mut pipe).await? {
                tracing::info!(%queue, %group, "consumer group deleted");
                return Ok(());
            }
        }

        Err(transaction::conflict("delete consumer group"))
    }

    pub async fn list(&self, queue: &QueueParams) -> Result<Vec<String>> {
        let mut conn = self.redis.shared().await?;
        checked_properties(&mut conn, queue).await?;
        let mut groups: Vec<String> = conn.smembers(QueueKeys::new(queue).groups()).await?;
        groups.sort();
        Ok(groups)
    }
}

/// The properties of a pub/sub queue whose state permits group
/// management.
async fn checked_properties(conn: &mut MultiplexedConnection, queue: &QueueParams) -> Result<QueueProperties> {
    let properties = load_properties(conn, queue).await?;
    if properties.delivery_model != DeliveryModel::PubSub {
        return Err(Error::ConsumerGroupsNotSupported { queue: queue.clone() });
    }
    properties.check(queue, Operation::ConsumerGroups)?;
    Ok(properties)
}

/// Adds a group, recording `owner` for ephemeral groups so the
/// watchdog can delete them with their consumer.
pub(crate) async fn save_group(
    conn: &mut MultiplexedConnection,
    queue: &QueueParams,
    group: &str,
    owner: Option<&str>,
) -> Result<bool> {
    let keys = QueueKeys::new(queue);

    for _ in 0..MAX_ATTEMPTS {
        transaction::watch(conn, &[keys.properties()]).await?;
        if let Err(error) = checked_properties(conn, queue).await {
            return transaction::abort(conn, error).await;
        }

        let mut pipe = redis::pipe();
        pipe.sadd(keys.groups(), group);
        if let Some(owner) = owner {
            pipe.hset(keys.ephemeral_groups(), group, owner).ignore();
        }
        let reply: Option<(u64,)> = pipe.atomic().query_async(conn).await?;
        if let Some((added,)) = reply {
            return Ok(added > 0);
        }
    }

    Err(transaction::conflict("save consumer group"))
}

/// Removes an ephemeral group together with its pending and delayed
/// messages.
pub(crate) async fn delete_ephemeral_group(
    redis: &RedisHandle,
    conn: &mut MultiplexedConnection,
    queue: &QueueParams,
    group: &str,
) -> Result<u64> {
    let keys = QueueKeys::new(queue);
    let kind = match load_properties(conn, queue).await {
        Ok(properties) if properties.queue_type.is_priority() => "zset",
        Ok(_) => "list",
        Err(Error::QueueNotFound { .. }) => return Ok(0),
        Err(error) => return Err(error),
    };

    let removed: u64 = redis
        .scripts()
        .delete_group
        .key(keys.pending(Some(group)))
        .key(keys.messages())
        .key(keys.groups())
        .key(keys.ephemeral_groups())
        .key(keys.delayed())
        .key(global::DELAYED)
        .arg(group)
        .arg(kind)
        .arg(global::MESSAGE_PREFIX)
        .invoke_async(conn)
        .await?;

    tracing::debug!(%queue, %group, removed, "ephemeral consumer group removed");
    Ok(removed)
}

/// How many of the queue's delayed messages belong to `group`.
async fn delayed_in_group(conn: &mut MultiplexedConnection, keys: &QueueKeys, group: &str) -> Result<usize> {
    let delayed: Vec<String> = conn.smembers(keys.delayed()).await?;
    if delayed.is_empty() {
        return Ok(0);
    }

    let mut pipe = redis::pipe();
    for id in &delayed {
        pipe.hget(format!("{}{id}", global::MESSAGE_PREFIX), "consumer_group");
    }
    let groups: Vec<Option<String>> = pipe.query_async(conn).await?;
    Ok(groups
        .iter()
        .filter(|owner| owner.as_deref() == Some(group))
        .count())
}
