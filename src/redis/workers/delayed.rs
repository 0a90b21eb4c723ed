use super::{batch, Worker};
use crate::error::Result;
use crate::events::{EventBus, WorkerEvent};
use crate::message::MessageId;
use crate::redis::keys::{self, global, QueueKeys};
use crate::redis::messages::load;
use crate::redis::RedisHandle;
use redis::AsyncCommands;

/// Returns unacknowledged messages to their pending structure once
/// their retry delay has elapsed.
#[derive(Debug)]
pub(super) struct DelayedWorker {
    redis: RedisHandle,
    events: EventBus<WorkerEvent>,
}

impl DelayedWorker {
    pub(super) fn new(redis: RedisHandle, events: EventBus<WorkerEvent>) -> Self { Self { redis, events } }
}

#[async_trait::async_trait]
impl Worker for DelayedWorker {
    const NAME: &'static str = "delayed";

    async fn tick(&self) -> Result<()> {
        let now = crate::redis::now();
        let limit = self.redis.config().workers.batch_size;
        let mut conn = self.redis.shared().await?;
        let due: Vec<String> = conn
            .zrangebyscore_limit(global::DELAYED, "-inf", now, 0, batch(limit))
            .await?;

        for id in due.into_iter().map(MessageId::new) {
            let envelope = match load(&mut conn, &id).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    conn.zrem::<_, _, ()>(global::DELAYED, &id).await?;
                    continue;
                }
                Err(error) if error.is_store_error() => return Err(error),
                Err(error) => {
                    tracing::error!(message_id = %id, %error, "could not load delayed message");
                    continue;
                }
            };

            let queue_keys = QueueKeys::new(&envelope.queue);
            let promoted: i64 = self
                .redis
                .scripts()
                .promote_delayed
                .key(global::DELAYED)
                .key(queue_keys.delayed())
                .key(keys::message(&id))
                .key(queue_keys.pending(envelope.consumer_group.as_deref()))
                .key(queue_keys.properties())
                .key(queue_keys.groups())
                .key(queue_keys.messages())
                .arg(&id)
                .arg(envelope.priority_score())
                .arg(envelope.consumer_group.as_deref().unwrap_or_default())
                .invoke_async(&mut *conn)
                .await?;

            match promoted {
                1 => {
                    tracing::debug!(message_id = %id, queue = %envelope.queue, "delayed message requeued");
                    self.events.emit(WorkerEvent::DelayedPromoted {
                        id,
                        queue: envelope.queue,
                    });
                }
                -1 => tracing::warn!(message_id = %id, queue = %envelope.queue, "delayed message dropped; its queue is gone"),
                -2 => tracing::warn!(
                    message_id = %id,
                    queue = %envelope.queue,
                    group = envelope.consumer_group.as_deref(),
                    "delayed message dropped; its consumer group is gone"
                ),
                // another worker got there first.
                _ => {}
            }
        }
        Ok(())
    }
}
