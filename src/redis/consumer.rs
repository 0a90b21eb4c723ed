use super::delivery::{acknowledge, unacknowledge};
use super::heartbeat::QueueRegistration;
use super::keys::{global, QueueKeys};
use super::queue::load_properties;
use super::rate_limit::RateLimiter;
use super::RedisHandle;
use crate::consumer::{ConsumerProvider, ConsumerStream};
use crate::error::{Error, Result};
use crate::events::{ConsumerEvent, EventBus};
use crate::message::{MessageEnvelope, UnackCause, Unacknowledgement};
use crate::queue::{Operation, QueueParams};
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Hands out one [`RedisStream`] per consumed queue.
#[derive(Debug, Clone)]
pub struct RedisConsumer {
    redis: RedisHandle,
    events: EventBus<ConsumerEvent>,
    /// Cancelled when the whole consumer shuts down.
    shutdown: CancellationToken,
}

impl RedisConsumer {
    #[must_use = "consumer does nothing unless used"]
    pub fn new(redis: RedisHandle, events: EventBus<ConsumerEvent>, shutdown: CancellationToken) -> Self {
        Self {
            redis,
            events,
            shutdown,
        }
    }
}

#[async_trait::async_trait]
impl ConsumerProvider for RedisConsumer {
    type Error = Error;
    type Stream = RedisStream;

    async fn stream(&self, consumer_id: &str, registration: &QueueRegistration) -> Result<Self::Stream> {
        // Blocking dequeues would stall every other user of a shared
        // connection, so each stream owns its own.
        let connection = self.redis.exclusive().await?;
        let config = self.redis.config();

        Ok(RedisStream {
            keys: QueueKeys::new(&registration.queue),
            queue: registration.queue.clone(),
            group: registration.group.clone(),
            consumer_id: consumer_id.into(),
            connection,
            rate_limiter: RateLimiter::new(self.redis.clone()),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
            priority_poll_interval: config.consumer.priority_poll_interval,
            redis: self.redis.clone(),
            paused: false,
        })
    }
}

/// Delivers the messages of one queue (or one consumer group of a
/// pub/sub queue) to one consumer.
///
/// A delivered message sits in the consumer's processing list until
/// it is acknowledged or unacknowledged; if the consumer dies first,
/// the watchdog finds it there.
pub struct RedisStream {
    redis: RedisHandle,
    keys: QueueKeys,
    queue: QueueParams,
    group: Option<String>,
    consumer_id: Box<str>,
    /// Used only by this stream, for the blocking dequeue.
    connection: MultiplexedConnection,
    rate_limiter: RateLimiter,
    events: EventBus<ConsumerEvent>,
    shutdown: CancellationToken,
    priority_poll_interval: Duration,
    /// Whether we already reported that the queue does not accept
    /// consumers; reset once it does again.
    paused: bool,
}

impl RedisStream {
    /// Moves one message id from the pending structure to our
    /// processing list.
    async fn dequeue(&mut self, priority: bool, timeout: Duration) -> Result<Option<String>> {
        let pending = self.keys.pending(self.group.as_deref());
        let processing = self.keys.processing(&self.consumer_id);

        if priority {
            let mut conn = self.redis.shared().await?;
            let id: Option<String> = self
                .redis
                .scripts()
                .dequeue_priority
                .key(pending)
                .key(processing)
                .invoke_async(&mut *conn)
                .await?;
            if id.is_none() {
                tokio::time::sleep(self.priority_poll_interval.min(timeout)).await;
            }
            return Ok(id);
        }

        let id: Option<String> = redis::cmd("BLMOVE")
            .arg(pending)
            .arg(processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut self.connection)
            .await?;
        Ok(id)
    }

    /// Waits until the rate limit grants a token.  Returns `false`
    /// when the consumer shut down first; the claimed message then
    /// stays in the processing list for the watchdog.
    async fn acquire(&self, rate_limit: &crate::queue::RateLimit) -> Result<bool> {
        loop {
            let now = super::now();
            if self.rate_limiter.acquire(&self.queue, rate_limit, now).await? {
                return Ok(true);
            }

            let wait = Duration::from_millis(rate_limit.until_next_window(now).max(1));
            tracing::debug!(queue = %self.queue, wait_ms = wait.as_millis(), "rate limit exhausted");
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(false),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn fetch(&mut self, id: &str) -> Result<Option<MessageEnvelope>> {
        let key = format!("{}{id}", global::MESSAGE_PREFIX);
        let mut conn = self.redis.shared().await?;
        let raw: Option<HashMap<String, String>> = self
            .redis
            .scripts()
            .fetch
            .key(&key)
            .key(self.keys.processing(&self.consumer_id))
            .arg(id)
            .arg(super::now())
            .arg(&*self.consumer_id)
            .invoke_async(&mut *conn)
            .await?;

        match raw {
            Some(raw) => MessageEnvelope::from_fields(&key, &raw).map(Some),
            None => {
                tracing::warn!(message_id = id, queue = %self.queue, "dequeued message no longer exists");
                Ok(None)
            }
        }
    }

    async fn poll_next(&mut self, timeout: Duration) -> Result<Option<MessageEnvelope>> {
        let properties = {
            let mut conn = self.redis.shared().await?;
            load_properties(&mut conn, &self.queue).await?
        };

        if !properties.state.permits(Operation::Consume) {
            if !self.paused {
                tracing::info!(queue = %self.queue, state = %properties.state, "queue does not accept consumers; waiting");
                self.paused = true;
            }
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        self.paused = false;

        let Some(id) = self.dequeue(properties.queue_type.is_priority(), timeout).await? else {
            return Ok(None);
        };

        if let Some(rate_limit) = &properties.rate_limit {
            if !self.acquire(rate_limit).await? {
                return Ok(None);
            }
        }

        let envelope = self.fetch(&id).await?;
        if let Some(envelope) = &envelope {
            tracing::debug!(message_id = %envelope.id(), queue = %self.queue, consumer_id = %self.consumer_id, "message received");
            self.events.emit(ConsumerEvent::MessageReceived {
                id: envelope.id().clone(),
                queue: self.queue.clone(),
                consumer_id: self.consumer_id.to_string(),
            });
        }
        Ok(envelope)
    }
}

impl std::fmt::Debug for RedisStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStream")
            .field("queue", &self.queue)
            .field("group", &self.group)
            .field("consumer_id", &self.consumer_id)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ConsumerStream for RedisStream {
    type Error = Error;

    async fn next(mut self: Pin<&mut Self>, timeout: Duration) -> Result<Option<MessageEnvelope>> {
        self.poll_next(timeout).await
    }

    #[tracing::instrument(skip_all, fields(message_id = %envelope.id(), consumer_id = %self.consumer_id))]
    async fn ack(self: Pin<&mut Self>, envelope: &MessageEnvelope) -> Result<()> {
        let mut conn = self.redis.shared().await?;
        if !acknowledge(&self.redis, &mut conn, envelope, &self.consumer_id).await? {
            tracing::warn!("message was recovered from this consumer before it was acknowledged");
            return Ok(());
        }

        self.events.emit(ConsumerEvent::MessageAcknowledged {
            id: envelope.id().clone(),
            queue: self.queue.clone(),
            consumer_id: self.consumer_id.to_string(),
        });
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(message_id = %envelope.id(), consumer_id = %self.consumer_id, %cause))]
    async fn unack(self: Pin<&mut Self>, envelope: &MessageEnvelope, cause: UnackCause) -> Result<()> {
        let this = &*self;
        let mut conn = this.redis.shared().await?;
        let decision = unacknowledge(&this.redis, &mut conn, envelope, &this.consumer_id, &cause).await?;

        let Some(decision) = decision else {
            tracing::warn!("message was recovered from this consumer before it was unacknowledged");
            return Ok(());
        };

        let id = envelope.id().clone();
        let queue = this.queue.clone();
        this.events.emit(ConsumerEvent::MessageUnacknowledged {
            id: id.clone(),
            queue: queue.clone(),
            consumer_id: this.consumer_id.to_string(),
            cause: cause.clone(),
        });
        this.events.emit(match decision {
            Unacknowledgement::Requeue => ConsumerEvent::MessageRequeued { id, queue },
            Unacknowledgement::Delay { until } => ConsumerEvent::MessageDelayed { id, queue, until },
            Unacknowledgement::DeadLetter => ConsumerEvent::MessageDeadLettered { id, queue, cause },
        });
        Ok(())
    }
}
