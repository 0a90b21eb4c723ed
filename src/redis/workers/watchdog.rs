use super::{batch, Worker};
use crate::error::Result;
use crate::events::{EventBus, WorkerEvent};
use crate::message::{MessageId, UnackCause};
use crate::redis::consumer_group::delete_ephemeral_group;
use crate::redis::delivery::unacknowledge;
use crate::redis::heartbeat::{load_info, unregister};
use crate::redis::keys::{global, QueueKeys};
use crate::redis::messages::load;
use crate::redis::RedisHandle;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

/// Recovers the messages of consumers whose heartbeat went stale.
///
/// A recovered message goes through the same unacknowledge decision
/// as a failed one, with cause [`UnackCause::OfflineConsumer`]; the
/// consumer's registration and ephemeral groups are removed after.
#[derive(Debug)]
pub(super) struct Watchdog {
    redis: RedisHandle,
    events: EventBus<WorkerEvent>,
}

impl Watchdog {
    pub(super) fn new(redis: RedisHandle, events: EventBus<WorkerEvent>) -> Self { Self { redis, events } }

    /// Heartbeats older than this are stale.
    fn cutoff(&self, now: i64) -> i64 {
        let threshold = self.redis.config().consumer.liveness_threshold;
        now - i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX)
    }

    /// Consumers that missed their heartbeats for the whole liveness
    /// threshold, or that are registered without one.
    async fn offline(&self, conn: &mut MultiplexedConnection, now: i64) -> Result<Vec<String>> {
        let limit = self.redis.config().workers.batch_size;
        let mut offline: Vec<String> = conn
            .zrangebyscore_limit(global::HEARTBEATS, "-inf", self.cutoff(now), 0, batch(limit))
            .await?;

        let registered: Vec<String> = conn.hkeys(global::CONSUMERS).await?;
        for consumer_id in registered {
            let beat: Option<i64> = conn.zscore(global::HEARTBEATS, &consumer_id).await?;
            if beat.is_none() && !offline.contains(&consumer_id) {
                offline.push(consumer_id);
            }
        }
        Ok(offline)
    }

    /// Returns how many messages were recovered, or `None` when the
    /// consumer turned out to be alive and was left registered.
    #[tracing::instrument(skip(self, conn))]
    async fn recover(&self, conn: &mut MultiplexedConnection, consumer_id: &str, now: i64) -> Result<Option<usize>> {
        let info = load_info(conn, consumer_id).await?;
        let registrations = info.iter().flat_map(|info| &info.queues);
        let mut recovered = 0;

        for registration in registrations.clone() {
            let processing = QueueKeys::new(&registration.queue).processing(consumer_id);
            let held: Vec<String> = conn.lrange(&processing, 0, -1).await?;

            for id in held.into_iter().map(MessageId::new) {
                let Some(envelope) = load(conn, &id).await? else {
                    conn.lrem::<_, _, ()>(&processing, 0, &id).await?;
                    continue;
                };
                let cause = if envelope.is_expired(now) {
                    UnackCause::TtlExpired
                } else {
                    UnackCause::OfflineConsumer
                };
                if unacknowledge(&self.redis, conn, &envelope, consumer_id, &cause)
                    .await?
                    .is_some()
                {
                    recovered += 1;
                }
            }
        }

        if !unregister(&self.redis, conn, consumer_id, info.as_ref(), self.cutoff(now)).await? {
            tracing::warn!(recovered, "consumer is alive after all; left registered");
            return Ok(None);
        }

        for registration in registrations {
            if let (true, Some(group)) = (registration.ephemeral, &registration.group) {
                delete_ephemeral_group(&self.redis, conn, &registration.queue, group).await?;
            }
        }
        Ok(Some(recovered))
    }
}

#[async_trait::async_trait]
impl Worker for Watchdog {
    const NAME: &'static str = "watchdog";

    async fn tick(&self) -> Result<()> {
        let now = crate::redis::now();
        let mut conn = self.redis.shared().await?;

        for consumer_id in self.offline(&mut conn, now).await? {
            let Some(messages) = self.recover(&mut conn, &consumer_id, now).await? else {
                continue;
            };
            tracing::info!(%consumer_id, messages, "recovered offline consumer");
            self.events.emit(WorkerEvent::ConsumerRecovered {
                consumer_id,
                messages,
            });
        }
        Ok(())
    }
}
