//! Observability events.
//!
//! Each role owns one [`EventBus`] carrying a closed set of events.
//! Nothing in the queue depends on these being received; a bus with
//! no subscribers simply drops them.

use crate::message::{MessageId, UnackCause};
use crate::queue::QueueParams;
use tokio::sync::broadcast;

const CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> { self.tx.subscribe() }

    pub(crate) fn emit(&self, event: E) {
        // an error only means there are no receivers right now.
        self.tx.send(event).ok();
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self { Self::new() }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProducerEvent {
    MessagePublished {
        id: MessageId,
        queue: QueueParams,
        producer_id: String,
    },
    MessageScheduled {
        id: MessageId,
        queue: QueueParams,
        producer_id: String,
        at: i64,
    },
    Error {
        producer_id: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConsumerEvent {
    Up {
        consumer_id: String,
    },
    Down {
        consumer_id: String,
    },
    MessageReceived {
        id: MessageId,
        queue: QueueParams,
        consumer_id: String,
    },
    MessageAcknowledged {
        id: MessageId,
        queue: QueueParams,
        consumer_id: String,
    },
    MessageUnacknowledged {
        id: MessageId,
        queue: QueueParams,
        consumer_id: String,
        cause: UnackCause,
    },
    MessageRequeued {
        id: MessageId,
        queue: QueueParams,
    },
    MessageDelayed {
        id: MessageId,
        queue: QueueParams,
        until: i64,
    },
    MessageDeadLettered {
        id: MessageId,
        queue: QueueParams,
        cause: UnackCause,
    },
    Error {
        consumer_id: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkerEvent {
    ScheduledPromoted {
        parent_id: MessageId,
        ids: Vec<MessageId>,
        queue: QueueParams,
    },
    DelayedPromoted {
        id: MessageId,
        queue: QueueParams,
    },
    ConsumerRecovered {
        consumer_id: String,
        messages: usize,
    },
    Error {
        worker: &'static str,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_to_every_subscriber() {
        let bus = EventBus::<ConsumerEvent>::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ConsumerEvent::Up {
            consumer_id: "c1".to_owned(),
        });

        let expected = ConsumerEvent::Up {
            consumer_id: "c1".to_owned(),
        };
        assert_eq!(a.recv().await.expect("a"), expected);
        assert_eq!(b.recv().await.expect("b"), expected);
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::<WorkerEvent>::default();
        bus.emit(WorkerEvent::Error {
            worker: "watchdog",
            error: "boom".to_owned(),
        });
    }
}
