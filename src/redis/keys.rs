use crate::exchange::ExchangeParams;
use crate::message::MessageId;
use crate::queue::QueueParams;

const PREFIX: &str = "smq";

/// Global keys, shared by every namespace.
pub(crate) mod global {
    /// Set of namespaces holding at least one queue or exchange.
    pub(crate) const NAMESPACES: &str = "smq:namespaces";
    /// Sorted set of scheduled message ids, scored by their next
    /// firing (milliseconds).
    pub(crate) const SCHEDULED: &str = "smq:scheduled";
    /// Sorted set of unacknowledged message ids waiting for their
    /// retry delay, scored by the time they are due.
    pub(crate) const DELAYED: &str = "smq:delayed";
    /// Sorted set of consumer ids, scored by their last heartbeat.
    pub(crate) const HEARTBEATS: &str = "smq:heartbeats";
    /// Hash of consumer id to the consumer's registration.
    pub(crate) const CONSUMERS: &str = "smq:consumers";
    /// Prefix of message hashes; scripts build message keys from it.
    pub(crate) const MESSAGE_PREFIX: &str = "smq:message:";
}

pub(crate) fn message(id: &MessageId) -> String { format!("{}{id}", global::MESSAGE_PREFIX) }

pub(crate) fn namespace_queues(namespace: &str) -> String { format!("{PREFIX}:ns:{namespace}:queues") }

pub(crate) fn namespace_exchanges(namespace: &str) -> String {
    format!("{PREFIX}:ns:{namespace}:exchanges")
}

/// The keys of one queue.
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    base: String,
}

impl QueueKeys {
    pub(crate) fn new(queue: &QueueParams) -> Self {
        Self {
            base: format!("{PREFIX}:q:{}:{}", queue.namespace, queue.name),
        }
    }

    /// Hash of the queue's properties.
    pub(crate) fn properties(&self) -> String { format!("{}:properties", self.base) }

    /// The pending structure: a list, or a sorted set for priority
    /// queues.  Pub/sub queues have one per consumer group.
    pub(crate) fn pending(&self, group: Option<&str>) -> String {
        match group {
            Some(group) => format!("{}:pending:{group}", self.base),
            None => format!("{}:pending", self.base),
        }
    }

    /// Prefix of the per-group pending keys, for scripts.
    pub(crate) fn pending_group_prefix(&self) -> String { format!("{}:pending:", self.base) }

    /// List of messages claimed by one consumer.
    pub(crate) fn processing(&self, consumer_id: &str) -> String {
        format!("{}:processing:{consumer_id}", self.base)
    }

    pub(crate) fn processing_prefix(&self) -> String { format!("{}:processing:", self.base) }

    /// Set of the consumers registered on the queue.
    pub(crate) fn consumers(&self) -> String { format!("{}:consumers", self.base) }

    /// Set of the consumer groups of a pub/sub queue.
    pub(crate) fn groups(&self) -> String { format!("{}:groups", self.base) }

    /// Hash of ephemeral group id to the consumer that owns it.
    pub(crate) fn ephemeral_groups(&self) -> String { format!("{}:ephemeral-groups", self.base) }

    pub(crate) fn acknowledged(&self) -> String { format!("{}:acknowledged", self.base) }

    pub(crate) fn dead_lettered(&self) -> String { format!("{}:dead-lettered", self.base) }

    /// Set of the queue's ids in the global scheduled set.
    pub(crate) fn scheduled(&self) -> String { format!("{}:scheduled", self.base) }

    /// Set of the queue's ids in the global delayed set.
    pub(crate) fn delayed(&self) -> String { format!("{}:delayed", self.base) }

    /// Set of every message id owned by the queue.
    pub(crate) fn messages(&self) -> String { format!("{}:messages", self.base) }

    /// Set of exchanges the queue is bound to.
    pub(crate) fn exchanges(&self) -> String { format!("{}:exchanges", self.base) }

    pub(crate) fn rate_limit_window(&self, window: u64) -> String {
        format!("{}:rate:{window}", self.base)
    }
}

/// The keys of one exchange.
#[derive(Debug, Clone)]
pub(crate) struct ExchangeKeys {
    base: String,
}

impl ExchangeKeys {
    pub(crate) fn new(exchange: &ExchangeParams) -> Self {
        Self {
            base: format!("{PREFIX}:x:{}:{}", exchange.namespace, exchange.name),
        }
    }

    /// Hash holding the exchange kind.
    pub(crate) fn properties(&self) -> String { format!("{}:properties", self.base) }

    /// Set of encoded bindings.
    pub(crate) fn bindings(&self) -> String { format!("{}:bindings", self.base) }
}
