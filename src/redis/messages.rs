use super::keys::{self, global, QueueKeys};
use super::queue::load_properties;
use super::scripts::{encode_fields, Guarded};
use super::RedisHandle;
use crate::error::{Error, Result};
use crate::message::{MessageEnvelope, MessageId, MessageStatus};
use crate::queue::{DeliveryModel, MessageSet, Operation, QueueParams, QueueProperties, QueueState};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;

/// The number of messages in each structure of a queue, read in one
/// atomic step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Across every consumer group of a pub/sub queue.
    pub pending: u64,
    pub processing: u64,
    pub acknowledged: u64,
    pub dead_lettered: u64,
    pub scheduled: u64,
    pub delayed: u64,
}

/// One page of a listing.  Pages are numbered from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Entries in the whole structure, not just this page.
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

/// The outcome of [`Messages::delete`], one list per outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub processed: Vec<MessageId>,
    pub success: Vec<MessageId>,
    pub not_found: Vec<MessageId>,
    /// Held by a consumer; these are left alone.
    pub in_process: Vec<MessageId>,
}

/// Reads and manages individual messages.
#[derive(Debug, Clone)]
pub struct Messages {
    redis: RedisHandle,
}

impl Messages {
    #[must_use]
    pub fn new(redis: RedisHandle) -> Self { Self { redis } }

    pub async fn count_by_status(&self, queue: &QueueParams) -> Result<QueueCounts> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.shared().await?;
        let counts: Option<(u64, u64, u64, u64, u64, u64)> = self
            .redis
            .scripts()
            .count
            .key(keys.properties())
            .key(keys.pending(None))
            .key(keys.groups())
            .key(keys.consumers())
            .key(keys.acknowledged())
            .key(keys.dead_lettered())
            .key(keys.scheduled())
            .key(keys.delayed())
            .arg(keys.pending_group_prefix())
            .arg(keys.processing_prefix())
            .invoke_async(&mut *conn)
            .await?;

        let (pending, processing, acknowledged, dead_lettered, scheduled, delayed) =
            counts.ok_or_else(|| Error::QueueNotFound { queue: queue.clone() })?;
        Ok(QueueCounts {
            pending,
            processing,
            acknowledged,
            dead_lettered,
            scheduled,
            delayed,
        })
    }

    pub async fn get(&self, id: &MessageId) -> Result<MessageEnvelope> {
        let mut conn = self.redis.shared().await?;
        load(&mut conn, id)
            .await?
            .ok_or_else(|| Error::MessageNotFound { id: id.clone() })
    }

    /// Loads every message of `ids` that still exists, in the order
    /// given.
    pub async fn get_many(&self, ids: &[MessageId]) -> Result<Vec<MessageEnvelope>> {
        let mut conn = self.redis.shared().await?;
        load_many(&mut conn, ids).await
    }

    /// Lists one structure of a queue.  Pending messages come in
    /// delivery order; audit records newest first.  Scheduled and
    /// delayed messages are ordered by id, which follows creation
    /// time.
    #[tracing::instrument(skip(self))]
    pub async fn list(
        &self,
        queue: &QueueParams,
        set: MessageSet,
        page: u64,
        page_size: u64,
    ) -> Result<Page<MessageEnvelope>> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let start = (page - 1).saturating_mul(page_size);
        let end = start.saturating_add(page_size) - 1;

        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.shared().await?;
        let conn = &mut *conn;
        let properties = load_properties(conn, queue).await?;

        let (ids, total): (Vec<String>, u64) = match &set {
            MessageSet::Pending { group } => {
                let key = pending_key(queue, &keys, &properties, group.as_deref())?;
                if properties.queue_type.is_priority() {
                    let total: u64 = conn.zcard(&key).await?;
                    (conn.zrange(&key, rank(start), rank(end)).await?, total)
                } else {
                    // the next message to deliver sits at the right end.
                    let total: u64 = conn.llen(&key).await?;
                    let mut ids: Vec<String> = conn
                        .lrange(&key, -rank(end) - 1, -rank(start) - 1)
                        .await?;
                    ids.reverse();
                    (ids, total)
                }
            }
            MessageSet::Acknowledged | MessageSet::DeadLettered => {
                let key = if set == MessageSet::Acknowledged {
                    keys.acknowledged()
                } else {
                    keys.dead_lettered()
                };
                let total: u64 = conn.zcard(&key).await?;
                (conn.zrevrange(&key, rank(start), rank(end)).await?, total)
            }
            MessageSet::Scheduled | MessageSet::Delayed => {
                let key = if set == MessageSet::Scheduled {
                    keys.scheduled()
                } else {
                    keys.delayed()
                };
                let mut ids: Vec<String> = conn.smembers(&key).await?;
                ids.sort();
                let total = ids.len() as u64;
                let ids = ids
                    .into_iter()
                    .skip(usize::try_from(start).unwrap_or(usize::MAX))
                    .take(usize::try_from(page_size).unwrap_or(usize::MAX))
                    .collect();
                (ids, total)
            }
        };

        let ids = ids.into_iter().map(MessageId::new).collect::<Vec<_>>();
        Ok(Page {
            items: load_many(conn, &ids).await?,
            total,
            page,
            page_size,
        })
    }

    /// Publishes a fresh copy of an acknowledged or dead-lettered
    /// message, and returns the copy's id.  Each message can be
    /// requeued once; the original records the copy's id.
    #[tracing::instrument(skip(self))]
    pub async fn requeue(&self, queue: &QueueParams, id: &MessageId) -> Result<MessageId> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.shared().await?;
        let conn = &mut *conn;

        load_properties(conn, queue)
            .await?
            .check(queue, Operation::ManageMessages)?;
        let original = match load(conn, id).await? {
            Some(original) if original.queue == *queue => original,
            _ => return Err(Error::MessageNotFound { id: id.clone() }),
        };

        let source = match original.status() {
            MessageStatus::Acknowledged => keys.acknowledged(),
            MessageStatus::DeadLettered => keys.dead_lettered(),
            _ => return Err(Error::MessageNotRequeuable { id: id.clone() }),
        };
        if original.state.requeued_message_id.is_some() {
            return Err(Error::MessageNotRequeuable { id: id.clone() });
        }

        let now = super::now();
        let copy = original.child(original.consumer_group.clone(), now);
        let reply: Guarded = self
            .redis
            .scripts()
            .requeue
            .key(source)
            .key(keys::message(id))
            .key(keys.properties())
            .key(keys.messages())
            .key(keys::message(copy.id()))
            .key(keys.pending(copy.consumer_group.as_deref()))
            .key(keys.groups())
            .arg(id)
            .arg(copy.id())
            .arg(encode_fields(&copy.to_fields()?)?)
            .arg(QueueState::permitting(Operation::ManageMessages))
            .arg(copy.priority_score())
            .arg(now)
            .arg(copy.consumer_group.as_deref().unwrap_or_default())
            .invoke_async(conn)
            .await?;

        if reply.code == Guarded::GROUP_NOT_FOUND {
            return Err(Error::ConsumerGroupNotFound {
                queue: queue.clone(),
                group: reply.detail,
            });
        }

        if !reply.check("requeue", queue, Operation::ManageMessages)? {
            // requeued, evicted, or deleted since we read it.
            return Err(Error::MessageNotRequeuable { id: id.clone() });
        }

        tracing::info!(%queue, message_id = %id, requeued_id = %copy.id(), "message requeued");
        Ok(copy.state.id)
    }

    /// Deletes messages wherever they are, except from a consumer's
    /// hands.
    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn delete(&self, queue: &QueueParams, ids: &[MessageId]) -> Result<DeleteReport> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.shared().await?;
        load_properties(&mut conn, queue)
            .await?
            .check(queue, Operation::ManageMessages)?;

        let mut report = DeleteReport::default();
        for id in ids {
            let outcome: i64 = self
                .redis
                .scripts()
                .delete_message
                .key(keys::message(id))
                .key(keys.messages())
                .key(keys.acknowledged())
                .key(keys.dead_lettered())
                .key(global::SCHEDULED)
                .key(keys.scheduled())
                .key(global::DELAYED)
                .key(keys.delayed())
                .key(keys.properties())
                .key(keys.consumers())
                .arg(id)
                .arg(keys.pending(None))
                .arg(keys.pending_group_prefix())
                .arg(keys.processing_prefix())
                .invoke_async(&mut *conn)
                .await?;

            report.processed.push(id.clone());
            match outcome {
                1 => report.success.push(id.clone()),
                2 => report.in_process.push(id.clone()),
                _ => report.not_found.push(id.clone()),
            }
        }

        tracing::debug!(
            %queue,
            deleted = report.success.len(),
            in_process = report.in_process.len(),
            "messages deleted"
        );
        Ok(report)
    }
}

fn pending_key(
    queue: &QueueParams,
    keys: &QueueKeys,
    properties: &QueueProperties,
    group: Option<&str>,
) -> Result<String> {
    match (properties.delivery_model, group) {
        (DeliveryModel::PubSub, None) => Err(Error::ConsumerGroupRequired { queue: queue.clone() }),
        (DeliveryModel::PointToPoint, Some(_)) => {
            Err(Error::ConsumerGroupsNotSupported { queue: queue.clone() })
        }
        (_, group) => Ok(keys.pending(group)),
    }
}

fn rank(index: u64) -> isize { isize::try_from(index).unwrap_or(isize::MAX) }

pub(crate) async fn load(conn: &mut MultiplexedConnection, id: &MessageId) -> Result<Option<MessageEnvelope>> {
    let key = keys::message(id);
    let raw: HashMap<String, String> = conn.hgetall(&key).await?;
    if raw.is_empty() {
        return Ok(None);
    }
    MessageEnvelope::from_fields(&key, &raw).map(Some)
}

async fn load_many(conn: &mut MultiplexedConnection, ids: &[MessageId]) -> Result<Vec<MessageEnvelope>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }

    let mut pipe = redis::pipe();
    for id in ids {
        pipe.hgetall(keys::message(id));
    }
    let raws: Vec<HashMap<String, String>> = pipe.query_async(conn).await?;

    ids.iter()
        .zip(raws)
        .filter(|(_, raw)| !raw.is_empty())
        .map(|(id, raw)| MessageEnvelope::from_fields(&keys::message(id), &raw))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueType;

    fn properties(delivery_model: DeliveryModel) -> QueueProperties {
        QueueProperties {
            queue_type: QueueType::Fifo,
            delivery_model,
            state: QueueState::Active,
            rate_limit: None,
            created_at: 0,
        }
    }

    #[test]
    fn pending_listing_needs_a_group_only_on_pub_sub() {
        let queue = QueueParams::new("test", "orders").expect("queue");
        let keys = QueueKeys::new(&queue);

        assert!(matches!(
            pending_key(&queue, &keys, &properties(DeliveryModel::PubSub), None),
            Err(Error::ConsumerGroupRequired { .. })
        ));
        assert!(matches!(
            pending_key(&queue, &keys, &properties(DeliveryModel::PointToPoint), Some("g1")),
            Err(Error::ConsumerGroupsNotSupported { .. })
        ));
        assert_eq!(
            pending_key(&queue, &keys, &properties(DeliveryModel::PubSub), Some("g1")).expect("key"),
            keys.pending(Some("g1"))
        );
    }
}
