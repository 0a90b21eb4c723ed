use super::exchange::Exchanges;
use super::keys::{self, global, QueueKeys};
use super::queue::load_properties;
use super::scripts::{decode_reply, encode_fields, Guarded};
use super::RedisHandle;
use crate::error::{Error, Result};
use crate::events::{EventBus, ProducerEvent};
use crate::message::{Destination, MessageEnvelope, MessageId, MessageStatus, ProducibleMessage};
use crate::producer::ProducerProvider;
use crate::queue::{DeliveryModel, Operation, QueueParams, QueueState, QueueType};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

/// Publishes messages, immediately or through the scheduler.
#[derive(Debug, Clone)]
pub struct RedisProducer {
    redis: RedisHandle,
    exchanges: Exchanges,
    producer_id: String,
    events: EventBus<ProducerEvent>,
}

impl RedisProducer {
    /// Creates a new producer with a fresh producer id.
    #[must_use = "a producer does nothing unless used"]
    pub fn new(redis: RedisHandle) -> Self {
        Self {
            exchanges: Exchanges::new(redis.clone()),
            redis,
            producer_id: uuid::Uuid::new_v4().to_string(),
            events: EventBus::new(),
        }
    }

    /// Emits events on `events` instead of a private bus.
    #[must_use]
    pub fn with_events(self, events: EventBus<ProducerEvent>) -> Self { Self { events, ..self } }

    #[must_use]
    pub fn id(&self) -> &str { &self.producer_id }

    #[must_use]
    pub fn events(&self) -> &EventBus<ProducerEvent> { &self.events }

    async fn destinations(&self, destination: &Destination) -> Result<Vec<QueueParams>> {
        let queues = match destination {
            Destination::Queue { queue } => vec![queue.clone()],
            Destination::Exchange {
                exchange,
                routing_key,
            } => {
                self.exchanges
                    .match_queues(exchange, routing_key.as_deref())
                    .await?
            }
        };
        if queues.is_empty() {
            return Err(Error::NoMatchingQueues);
        }
        Ok(queues)
    }

    async fn produce_to(
        &self,
        conn: &mut MultiplexedConnection,
        message: &ProducibleMessage,
        queue: &QueueParams,
    ) -> Result<Vec<MessageId>> {
        let properties = load_properties(conn, queue).await?;
        message.check_priority(queue, properties.queue_type)?;
        properties.check(queue, Operation::Produce)?;

        if message.schedule.is_scheduled() {
            return self.schedule(conn, message, queue).await.map(|id| vec![id]);
        }

        let groups = match properties.delivery_model {
            DeliveryModel::PointToPoint => vec![None],
            DeliveryModel::PubSub => {
                let groups: Vec<String> = conn.smembers(QueueKeys::new(queue).groups()).await?;
                if groups.is_empty() {
                    return Err(Error::NoConsumerGroups { queue: queue.clone() });
                }
                groups.into_iter().map(Some).collect()
            }
        };

        let now = super::now();
        let envelopes = groups
            .into_iter()
            .map(|group| {
                let mut envelope =
                    MessageEnvelope::new(message.clone(), queue.clone(), group, MessageStatus::Pending);
                envelope.state.published_at = Some(now);
                envelope
            })
            .collect::<Vec<_>>();

        self.publish(conn, queue, properties.queue_type, &envelopes).await?;

        let ids = envelopes
            .iter()
            .map(|envelope| envelope.id().clone())
            .collect::<Vec<_>>();
        for id in &ids {
            tracing::debug!(message_id = %id, %queue, "message published");
            self.events.emit(ProducerEvent::MessagePublished {
                id: id.clone(),
                queue: queue.clone(),
                producer_id: self.producer_id.clone(),
            });
        }
        Ok(ids)
    }

    /// Writes every envelope and pushes it to its pending structure in
    /// one script, so a publish to several consumer groups is all or
    /// nothing.
    async fn publish(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &QueueParams,
        queue_type: QueueType,
        envelopes: &[MessageEnvelope],
    ) -> Result<()> {
        let keys = QueueKeys::new(queue);
        let score = envelopes.first().map_or(0, MessageEnvelope::priority_score);

        let mut invocation = self.redis.scripts().publish.prepare_invoke();
        invocation
            .key(keys.properties())
            .key(keys.messages())
            .arg(QueueState::permitting(Operation::Produce))
            .arg(queue_type.as_str())
            .arg(score);
        for envelope in envelopes {
            invocation
                .key(keys::message(envelope.id()))
                .key(keys.pending(envelope.consumer_group.as_deref()))
                .arg(envelope.id())
                .arg(encode_fields(&envelope.to_fields()?)?);
        }

        let reply: Guarded = invocation.invoke_async(conn).await?;
        if reply.code == Guarded::TYPE_MISMATCH {
            // The queue was recreated with another type since its
            // properties were read.
            let current: QueueType = decode_reply("publish", &reply.detail)?;
            if let Some(envelope) = envelopes.first() {
                envelope.message.check_priority(queue, current)?;
            }
        }
        reply.check("publish", queue, Operation::Produce)?;
        Ok(())
    }

    async fn schedule(
        &self,
        conn: &mut MultiplexedConnection,
        message: &ProducibleMessage,
        queue: &QueueParams,
    ) -> Result<MessageId> {
        let now = super::now();
        let mut envelope = MessageEnvelope::new(message.clone(), queue.clone(), None, MessageStatus::Scheduled);
        envelope.state.scheduled_at = Some(now);
        let at = envelope
            .next_scheduled_timestamp(now)?
            .ok_or_else(|| Error::InvalidSchedule {
                reason: "the schedule never fires".to_owned(),
            })?;

        let keys = QueueKeys::new(queue);
        let reply: Guarded = self
            .redis
            .scripts()
            .schedule
            .key(keys.properties())
            .key(keys.messages())
            .key(keys::message(envelope.id()))
            .key(global::SCHEDULED)
            .key(keys.scheduled())
            .arg(QueueState::permitting(Operation::Produce))
            .arg(envelope.id())
            .arg(encode_fields(&envelope.to_fields()?)?)
            .arg(at)
            .invoke_async(conn)
            .await?;
        reply.check("schedule", queue, Operation::Produce)?;

        tracing::debug!(message_id = %envelope.id(), %queue, at, "message scheduled");
        self.events.emit(ProducerEvent::MessageScheduled {
            id: envelope.id().clone(),
            queue: queue.clone(),
            producer_id: self.producer_id.clone(),
            at,
        });
        Ok(envelope.state.id)
    }

    async fn try_produce(&self, message: ProducibleMessage) -> Result<Vec<MessageId>> {
        message.validate()?;
        let Some(destination) = &message.destination else {
            return Err(Error::InvalidMessage {
                field: "destination",
                reason: "requires a queue or an exchange",
            });
        };
        let queues = self.destinations(destination).await?;

        let mut conn = self.redis.shared().await?;
        let mut ids = Vec::with_capacity(queues.len());
        for queue in &queues {
            ids.extend(self.produce_to(&mut conn, &message, queue).await?);
        }
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl ProducerProvider for RedisProducer {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(producer_id = %self.producer_id))]
    async fn produce(&self, message: ProducibleMessage) -> Result<Vec<MessageId>> {
        let result = self.try_produce(message).await;
        if let Err(error) = &result {
            tracing::debug!(%error, "produce failed");
            self.events.emit(ProducerEvent::Error {
                producer_id: self.producer_id.clone(),
                error: error.to_string(),
            });
        }
        result
    }
}
