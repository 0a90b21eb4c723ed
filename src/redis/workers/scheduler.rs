use super::{batch, Worker};
use crate::error::{Error, Result};
use crate::events::{EventBus, WorkerEvent};
use crate::message::{MessageEnvelope, MessageId};
use crate::queue::{DeliveryModel, Operation, QueueState};
use crate::redis::keys::{self, global, QueueKeys};
use crate::redis::messages::load;
use crate::redis::queue::load_properties;
use crate::redis::scripts::{encode_fields, Guarded};
use crate::redis::RedisHandle;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

/// Fires scheduled messages that are due: each firing publishes a
/// fresh copy (one per consumer group on pub/sub queues) and moves
/// the scheduled message to its next firing, or removes it once the
/// schedule is exhausted.
#[derive(Debug)]
pub(super) struct Scheduler {
    redis: RedisHandle,
    events: EventBus<WorkerEvent>,
}

impl Scheduler {
    pub(super) fn new(redis: RedisHandle, events: EventBus<WorkerEvent>) -> Self { Self { redis, events } }

    #[tracing::instrument(skip(self, conn), fields(message_id = id))]
    async fn fire(&self, conn: &mut MultiplexedConnection, id: &str, score: i64, now: i64) -> Result<()> {
        let id = MessageId::new(id);
        let Some(mut parent) = load(conn, &id).await? else {
            tracing::warn!("scheduled message has no body; dropping it");
            conn.zrem::<_, _, ()>(global::SCHEDULED, &id).await?;
            return Ok(());
        };
        let queue = parent.queue.clone();
        let keys = QueueKeys::new(&queue);

        let properties = match load_properties(conn, &queue).await {
            Ok(properties) => properties,
            Err(Error::QueueNotFound { .. }) => {
                tracing::warn!(%queue, "queue of scheduled message is gone; dropping it");
                conn.zrem::<_, _, ()>(global::SCHEDULED, &id).await?;
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        let groups = match properties.delivery_model {
            DeliveryModel::PointToPoint => vec![None],
            DeliveryModel::PubSub => {
                let groups: Vec<String> = conn.smembers(keys.groups()).await?;
                if groups.is_empty() {
                    tracing::warn!(%queue, "no consumer groups; firing delivers nothing");
                }
                groups.into_iter().map(Some).collect()
            }
        };

        let children = groups
            .into_iter()
            .map(|group| parent.child(group, now))
            .collect::<Vec<MessageEnvelope>>();
        parent.state.last_scheduled_at = Some(score);
        let next = parent.next_scheduled_timestamp(now.max(score))?;

        let mut invocation = self.redis.scripts().fire_scheduled.prepare_invoke();
        invocation
            .key(global::SCHEDULED)
            .key(keys.scheduled())
            .key(keys::message(&id))
            .key(keys.properties())
            .key(keys.messages())
            .arg(&id)
            .arg(score)
            .arg(next.unwrap_or(0))
            .arg(encode_fields(&parent.to_fields()?)?)
            .arg(QueueState::permitting(Operation::Produce))
            .arg(parent.priority_score());
        for child in &children {
            invocation
                .key(keys::message(child.id()))
                .key(keys.pending(child.consumer_group.as_deref()))
                .arg(child.id())
                .arg(encode_fields(&child.to_fields()?)?);
        }

        let reply: Guarded = invocation.invoke_async(conn).await?;
        match reply.code {
            Guarded::OK => {}
            Guarded::QUEUE_NOT_FOUND => {
                conn.zrem::<_, _, ()>(global::SCHEDULED, &id).await?;
                return Ok(());
            }
            Guarded::NOT_PERMITTED => {
                tracing::debug!(%queue, state = %reply.detail, "queue does not accept messages; firing postponed");
                return Ok(());
            }
            _ => {
                reply.check("fire_scheduled", &queue, Operation::Produce)?;
                return Ok(());
            }
        }

        let ids = children.iter().map(|child| child.id().clone()).collect::<Vec<_>>();
        tracing::debug!(%queue, fired = ids.len(), ?next, "scheduled message fired");
        self.events.emit(WorkerEvent::ScheduledPromoted {
            parent_id: id,
            ids,
            queue,
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl Worker for Scheduler {
    const NAME: &'static str = "scheduler";

    async fn tick(&self) -> Result<()> {
        let now = crate::redis::now();
        let limit = self.redis.config().workers.batch_size;
        let mut conn = self.redis.shared().await?;
        let due: Vec<(String, i64)> = conn
            .zrangebyscore_limit_withscores(global::SCHEDULED, "-inf", now, 0, batch(limit))
            .await?;

        for (id, score) in due {
            // one broken message must not hold up the rest.
            if let Err(error) = self.fire(&mut conn, &id, score, now).await {
                if error.is_store_error() {
                    return Err(error);
                }
                tracing::error!(message_id = %id, %error, "could not fire scheduled message");
            }
        }
        Ok(())
    }
}
