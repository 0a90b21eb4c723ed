use crate::message::{MessageEnvelope, MessageId};
use crate::queue::QueueParams;

/// A message handed to a handler, with its body deserialized.
#[derive(Debug)]
#[non_exhaustive]
pub struct Message<T> {
    pub id: MessageId,
    pub data: T,
    /// Failed attempts before this delivery.
    pub attempts: u32,
    pub queue: QueueParams,
    pub consumer_group: Option<String>,
}

impl<T> Message<T> {
    pub fn new(envelope: &MessageEnvelope, data: T) -> Self {
        Self {
            id: envelope.id().clone(),
            data,
            attempts: envelope.state.attempts,
            queue: envelope.queue.clone(),
            consumer_group: envelope.consumer_group.clone(),
        }
    }
}
