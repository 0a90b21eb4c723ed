use crate::message::{MessageId, ProducibleMessage};

#[async_trait::async_trait]
/// Something that publishes messages.
///
/// Publishing resolves the message's destination to its queues and
/// writes one copy into each.  Implementations are expected to be
/// cheap to share; [`RedisProducer`](crate::redis::RedisProducer)
/// only borrows a pooled connection while it publishes.
pub trait ProducerProvider {
    type Error: std::error::Error;

    /// Publishes a message.
    ///
    /// Returns the id of every copy written: one per destination
    /// queue, or one per consumer group for pub/sub queues.  A
    /// scheduled message yields the id of the scheduled parent; its
    /// firings get their own ids.
    async fn produce(&self, message: ProducibleMessage) -> Result<Vec<MessageId>, Self::Error>;
}
