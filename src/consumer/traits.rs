use crate::message::{MessageEnvelope, UnackCause};
use crate::redis::QueueRegistration;
use std::pin::Pin;

#[async_trait::async_trait]
pub trait ConsumerProvider {
    type Error: std::error::Error;
    type Stream: ConsumerStream<Error = Self::Error>;

    /// Opens the stream delivering `registration`'s messages to the
    /// consumer `consumer_id`.
    async fn stream(&self, consumer_id: &str, registration: &QueueRegistration) -> Result<Self::Stream, Self::Error>;
}

#[async_trait::async_trait]
pub trait ConsumerStream: Send + 'static {
    type Error: std::error::Error;

    /// Retrieves the next message in this consumer stream.
    ///
    /// If there is no message available, this method will wait for
    /// about `timeout` before returning `None`.  A returned message
    /// is held by this consumer until it is passed to `ack` or
    /// `unack`.
    async fn next(self: Pin<&mut Self>, timeout: std::time::Duration) -> Result<Option<MessageEnvelope>, Self::Error>;

    /// Acknowledges the given message.
    ///
    /// This moves the message to its terminal state, and prevents it
    /// from being re-delivered.  Acknowledging a message the consumer
    /// no longer holds is a no-op.
    async fn ack(self: Pin<&mut Self>, envelope: &MessageEnvelope) -> Result<(), Self::Error>;

    /// Negatively acknowledges the given message.
    ///
    /// Depending on its retry policy, the message is re-delivered
    /// right away, after its retry delay, or dead-lettered.
    async fn unack(self: Pin<&mut Self>, envelope: &MessageEnvelope, cause: UnackCause) -> Result<(), Self::Error>;
}
