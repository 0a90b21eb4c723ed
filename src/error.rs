use crate::message::MessageId;
use crate::queue::{DeliveryModel, Operation, QueueParams, QueueState, QueueType};

/// Every failure the queue can report.
///
/// Variants are grouped the way callers usually react to them:
/// validation problems are rejected before anything is written,
/// precondition failures describe the current state of the store,
/// [`Error::TransactionConflict`] can be retried, and the remaining
/// variants are connectivity or schema problems.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid message: {field} {reason}")]
    InvalidMessage {
        field: &'static str,
        reason: &'static str,
    },
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("invalid rate limit: {reason}")]
    InvalidRateLimit { reason: &'static str },
    #[error("invalid schedule parameters: {reason}")]
    InvalidSchedule { reason: String },

    #[error("queue {queue} does not exist")]
    QueueNotFound { queue: QueueParams },
    #[error("queue {queue} already exists as {queue_type}/{delivery_model}")]
    QueueExists {
        queue: QueueParams,
        queue_type: QueueType,
        delivery_model: DeliveryModel,
    },
    #[error("{operation} is not permitted on queue {queue} while it is {state}")]
    OperationNotPermitted {
        queue: QueueParams,
        operation: Operation,
        state: QueueState,
    },
    #[error("queue {queue} is a priority queue; a message priority is required")]
    PriorityRequired { queue: QueueParams },
    #[error("queue {queue} is not a priority queue; message priority is not supported")]
    PriorityNotSupported { queue: QueueParams },
    #[error("queue {queue} does not support consumer groups")]
    ConsumerGroupsNotSupported { queue: QueueParams },
    #[error("queue {queue} is a pub/sub queue; a consumer group is required")]
    ConsumerGroupRequired { queue: QueueParams },
    #[error("queue {queue} has no consumer groups to publish to")]
    NoConsumerGroups { queue: QueueParams },
    #[error("consumer group {group} does not exist on queue {queue}")]
    ConsumerGroupNotFound { queue: QueueParams, group: String },
    #[error("consumer group {group} on queue {queue} still has pending or delayed messages")]
    ConsumerGroupNotEmpty { queue: QueueParams, group: String },
    #[error("queue {queue} still has pending messages")]
    QueueNotEmpty { queue: QueueParams },
    #[error("queue {queue} has {consumers} registered consumer(s)")]
    QueueHasConsumers { queue: QueueParams, consumers: u64 },
    #[error("queue {queue} is bound to exchange(s)")]
    QueueBoundToExchange { queue: QueueParams },
    #[error("message {id} does not exist")]
    MessageNotFound { id: MessageId },
    #[error("message {id} is not in a requeuable state")]
    MessageNotRequeuable { id: MessageId },
    #[error("exchange {exchange} does not exist")]
    ExchangeNotFound { exchange: String },
    #[error("exchange {exchange} still has bound queues")]
    ExchangeHasBindings { exchange: String },
    #[error("exchange {exchange} already exists with a different kind")]
    ExchangeKindMismatch { exchange: String },
    #[error("queue {queue} has a different type than the queues bound to exchange {exchange}")]
    ExchangeQueueTypeMismatch { exchange: String, queue: QueueParams },
    #[error("exchange {exchange} requires a routing key")]
    RoutingKeyRequired { exchange: String },
    #[error("no queue matched the destination of the message")]
    NoMatchingQueues,

    #[error("watched keys changed during {operation}; gave up after {attempts} attempts")]
    TransactionConflict {
        operation: &'static str,
        attempts: u32,
    },

    #[error("failed to connect to redis: {source}")]
    Connection {
        #[source]
        source: bb8::RunError<redis::RedisError>,
    },
    #[error("redis command failed: {source}")]
    Redis {
        #[from]
        source: redis::RedisError,
    },
    #[error("failed to (de)serialize: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
    #[error("could not decode {key} field {field:?}: {reason}")]
    Decode {
        key: String,
        field: String,
        reason: String,
    },
    #[error("unexpected reply from script {script}: {reply}")]
    ScriptReply { script: &'static str, reply: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the failure came from the store itself, rather than
    /// from the request.  Background workers log these and try again
    /// on the next tick.
    #[must_use]
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Redis { .. } | Self::ScriptReply { .. }
        )
    }
}
