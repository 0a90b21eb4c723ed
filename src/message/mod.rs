//! Messages: the immutable payload a producer builds, and the
//! envelope that carries it through the queue together with its
//! mutable state.

mod id;
mod schedule;
mod state;

pub use self::id::MessageId;
pub use self::schedule::MessageSchedule;
pub use self::state::{MessageState, MessageStatus, UnackCause, Unacknowledgement};

use crate::error::{Error, Result};
use crate::exchange::ExchangeParams;
use crate::queue::{QueueParams, QueueType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a message should be published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    Queue {
        queue: QueueParams,
    },
    /// Routed through an exchange.  Direct and topic exchanges
    /// require a routing key; fan-out exchanges ignore it.
    Exchange {
        exchange: ExchangeParams,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        routing_key: Option<String>,
    },
}

/// Priority of a message on a priority queue.
///
/// The lower the numeric value, the sooner the message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    Highest = 0,
    VeryHigh = 1,
    High = 2,
    AboveNormal = 3,
    Normal = 4,
    Low = 5,
    VeryLow = 6,
    Lowest = 7,
}

impl MessagePriority {
    /// The sorted-set score of the priority.
    #[must_use]
    pub const fn score(self) -> u8 { self as u8 }
}

/// A message as built by a producer.
///
/// Everything here is fixed once the message is published; the
/// lifecycle lives in [`MessageState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducibleMessage {
    pub body: serde_json::Value,
    pub destination: Option<Destination>,
    /// Milliseconds a message may wait before it is considered
    /// expired; zero never expires.
    pub ttl: u64,
    /// Failed attempts allowed before the message is dead-lettered.
    pub retry_threshold: u32,
    /// Milliseconds to wait before a failed message is retried.
    pub retry_delay: u64,
    /// Milliseconds a handler may run before it is considered failed;
    /// zero waits forever.
    pub consume_timeout: u64,
    pub priority: Option<MessagePriority>,
    pub schedule: MessageSchedule,
}

impl ProducibleMessage {
    pub const DEFAULT_RETRY_THRESHOLD: u32 = 3;
    pub const DEFAULT_RETRY_DELAY: u64 = 60_000;

    /// Creates a message with the given body, serialized as JSON.
    pub fn new<T: Serialize + ?Sized>(body: &T) -> Result<Self> {
        Ok(Self {
            body: serde_json::to_value(body)?,
            destination: None,
            ttl: 0,
            retry_threshold: Self::DEFAULT_RETRY_THRESHOLD,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
            consume_timeout: 0,
            priority: None,
            schedule: MessageSchedule::default(),
        })
    }

    #[must_use]
    pub fn to_queue(self, queue: QueueParams) -> Self {
        Self {
            destination: Some(Destination::Queue { queue }),
            ..self
        }
    }

    #[must_use]
    pub fn to_exchange(self, exchange: ExchangeParams, routing_key: Option<String>) -> Self {
        Self {
            destination: Some(Destination::Exchange {
                exchange,
                routing_key,
            }),
            ..self
        }
    }

    #[must_use]
    pub fn with_ttl(self, ttl: Duration) -> Self {
        Self {
            ttl: duration_millis(ttl),
            ..self
        }
    }

    #[must_use]
    pub fn with_retry_threshold(self, retry_threshold: u32) -> Self {
        Self {
            retry_threshold,
            ..self
        }
    }

    #[must_use]
    pub fn with_retry_delay(self, retry_delay: Duration) -> Self {
        Self {
            retry_delay: duration_millis(retry_delay),
            ..self
        }
    }

    #[must_use]
    pub fn with_consume_timeout(self, consume_timeout: Duration) -> Self {
        Self {
            consume_timeout: duration_millis(consume_timeout),
            ..self
        }
    }

    #[must_use]
    pub fn with_priority(self, priority: MessagePriority) -> Self {
        Self {
            priority: Some(priority),
            ..self
        }
    }

    #[must_use]
    pub fn with_schedule_cron(mut self, expression: impl Into<String>) -> Self {
        self.schedule.cron = Some(expression.into());
        self
    }

    #[must_use]
    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule.delay = duration_millis(delay);
        self
    }

    #[must_use]
    pub fn with_schedule_repeat(mut self, repeat: u32, period: Duration) -> Self {
        self.schedule.repeat = repeat;
        self.schedule.repeat_period = duration_millis(period);
        self
    }

    /// Checks every field that can be checked without looking at the
    /// destination queue.
    pub fn validate(&self) -> Result<()> {
        if self.body.is_null() {
            return Err(Error::InvalidMessage {
                field: "body",
                reason: "is required",
            });
        }
        if self.destination.is_none() {
            return Err(Error::InvalidMessage {
                field: "destination",
                reason: "requires a queue or an exchange",
            });
        }
        self.schedule.validate()
    }

    /// A priority is required on priority queues and rejected
    /// everywhere else.
    pub fn check_priority(&self, queue: &QueueParams, queue_type: QueueType) -> Result<()> {
        match (queue_type.is_priority(), self.priority) {
            (true, None) => Err(Error::PriorityRequired {
                queue: queue.clone(),
            }),
            (false, Some(_)) => Err(Error::PriorityNotSupported {
                queue: queue.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// A message in the queue: the producible payload, the queue it
/// belongs to, and its lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub message: ProducibleMessage,
    pub queue: QueueParams,
    /// Set for messages of pub/sub queues.
    pub consumer_group: Option<String>,
    pub state: MessageState,
}

impl MessageEnvelope {
    pub(crate) fn new(
        message: ProducibleMessage,
        queue: QueueParams,
        consumer_group: Option<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            message,
            queue,
            consumer_group,
            state: MessageState::new(MessageId::generate(), status),
        }
    }

    #[must_use]
    pub fn id(&self) -> &MessageId { &self.state.id }

    #[must_use]
    pub fn status(&self) -> MessageStatus { self.state.status }

    /// The sorted-set score used when the queue is a priority queue.
    pub(crate) fn priority_score(&self) -> u8 {
        self.message
            .priority
            .map_or(MessagePriority::Normal.score(), MessagePriority::score)
    }

    /// Whether the message outlived its TTL at `now`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        let ttl = self.message.ttl;
        match self.state.published_at {
            Some(published_at) if ttl > 0 => now - published_at > millis(ttl),
            _ => false,
        }
    }

    /// Decides the transition for a message that was not
    /// acknowledged.  Counts the failed attempt first: a message with
    /// a retry threshold of zero is dead-lettered on its first
    /// failure.  Expired messages are always dead-lettered.
    #[must_use]
    pub fn unacknowledgement(&self, cause: &UnackCause, now: i64) -> Unacknowledgement {
        let attempts = self.state.attempts.saturating_add(1);

        if matches!(cause, UnackCause::TtlExpired) || attempts > self.message.retry_threshold {
            Unacknowledgement::DeadLetter
        } else if self.message.retry_delay == 0 {
            Unacknowledgement::Requeue
        } else {
            Unacknowledgement::Delay {
                until: now + millis(self.message.retry_delay),
            }
        }
    }

    /// Computes the next firing of a scheduled message; see
    /// [`MessageSchedule::next_timestamp`].
    pub fn next_scheduled_timestamp(&mut self, now: i64) -> Result<Option<i64>> {
        self.message.schedule.next_timestamp(&mut self.state, now)
    }

    /// A fresh pending copy linked to this message, as created when a
    /// schedule fires or a message is requeued.  The copy carries no
    /// scheduling directives, so it is delivered exactly once.
    pub(crate) fn child(&self, consumer_group: Option<String>, now: i64) -> Self {
        let mut message = self.message.clone();
        message.schedule = MessageSchedule::default();

        let mut child = Self::new(
            message,
            self.queue.clone(),
            consumer_group,
            MessageStatus::Pending,
        );
        child.state.parent_id = Some(self.id().clone());
        child.state.published_at = Some(now);
        child
    }
}

fn duration_millis(duration: Duration) -> u64 { u64::try_from(duration.as_millis()).unwrap_or(u64::MAX) }

fn millis(value: u64) -> i64 { i64::try_from(value).unwrap_or(i64::MAX) }

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> QueueParams { QueueParams::new("test", "orders").expect("queue") }

    fn envelope(message: ProducibleMessage) -> MessageEnvelope {
        MessageEnvelope::new(message, queue(), None, MessageStatus::Processing)
    }

    #[test]
    fn validates_required_fields() {
        let message = ProducibleMessage::new(&()).expect("message");
        assert!(matches!(
            message.validate(),
            Err(Error::InvalidMessage { field: "body", .. })
        ));

        let message = ProducibleMessage::new(&"hello").expect("message");
        assert!(matches!(
            message.validate(),
            Err(Error::InvalidMessage {
                field: "destination",
                ..
            })
        ));

        let message = message.to_queue(queue());
        assert!(message.validate().is_ok());
    }

    #[test]
    fn priority_must_match_queue_type() {
        let plain = ProducibleMessage::new(&1).expect("message").to_queue(queue());
        let prioritized = plain.clone().with_priority(MessagePriority::High);

        assert!(matches!(
            plain.check_priority(&queue(), QueueType::Priority),
            Err(Error::PriorityRequired { .. })
        ));
        assert!(matches!(
            prioritized.check_priority(&queue(), QueueType::Fifo),
            Err(Error::PriorityNotSupported { .. })
        ));
        assert!(prioritized.check_priority(&queue(), QueueType::Priority).is_ok());
        assert!(plain.check_priority(&queue(), QueueType::Lifo).is_ok());
    }

    #[test]
    fn zero_threshold_dead_letters_first_failure() {
        let message = ProducibleMessage::new(&1)
            .expect("message")
            .with_retry_threshold(0);
        let cause = UnackCause::HandlerError("boom".to_owned());
        assert_eq!(
            envelope(message).unacknowledgement(&cause, 0),
            Unacknowledgement::DeadLetter
        );
    }

    #[test]
    fn retries_until_threshold() {
        let message = ProducibleMessage::new(&1)
            .expect("message")
            .with_retry_threshold(2)
            .with_retry_delay(Duration::ZERO);
        let mut envelope = envelope(message);

        assert_eq!(
            envelope.unacknowledgement(&UnackCause::Timeout, 0),
            Unacknowledgement::Requeue
        );
        envelope.state.attempts = 1;
        assert_eq!(
            envelope.unacknowledgement(&UnackCause::Timeout, 0),
            Unacknowledgement::Requeue
        );
        envelope.state.attempts = 2;
        assert_eq!(
            envelope.unacknowledgement(&UnackCause::Timeout, 0),
            Unacknowledgement::DeadLetter
        );
    }

    #[test]
    fn delays_retries_with_a_delay() {
        let message = ProducibleMessage::new(&1)
            .expect("message")
            .with_retry_delay(Duration::from_secs(2));
        assert_eq!(
            envelope(message).unacknowledgement(&UnackCause::OfflineConsumer, 1_000),
            Unacknowledgement::Delay { until: 3_000 }
        );
    }

    #[test]
    fn expired_messages_are_dead_lettered() {
        let message = ProducibleMessage::new(&1)
            .expect("message")
            .with_ttl(Duration::from_millis(100));
        let mut envelope = envelope(message);
        envelope.state.published_at = Some(1_000);

        assert!(!envelope.is_expired(1_100));
        assert!(envelope.is_expired(1_101));
        assert_eq!(
            envelope.unacknowledgement(&UnackCause::TtlExpired, 1_101),
            Unacknowledgement::DeadLetter
        );
    }

    #[test]
    fn priority_scores_order_highest_first() {
        assert!(MessagePriority::Highest.score() < MessagePriority::High.score());
        assert!(MessagePriority::AboveNormal.score() < MessagePriority::Normal.score());
        assert!(MessagePriority::Low.score() < MessagePriority::VeryLow.score());
    }

    #[test]
    fn children_link_to_their_parent() {
        let message = ProducibleMessage::new(&1)
            .expect("message")
            .with_schedule_cron("0 * * * * *");
        let parent = MessageEnvelope::new(message, queue(), None, MessageStatus::Scheduled);
        let child = parent.child(Some("g1".to_owned()), 42);

        assert_ne!(child.id(), parent.id());
        assert_eq!(child.state.parent_id.as_ref(), Some(parent.id()));
        assert_eq!(child.status(), MessageStatus::Pending);
        assert_eq!(child.consumer_group.as_deref(), Some("g1"));
        assert!(!child.message.schedule.is_scheduled());
    }
}
