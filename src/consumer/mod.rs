mod build;
mod message;
mod traits;

pub use self::build::ConsumerBuilder;
pub use self::message::Message;
pub use self::traits::{ConsumerProvider, ConsumerStream};

use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::events::{ConsumerEvent, EventBus};
use crate::message::{MessageEnvelope, UnackCause};
use crate::queue::{validate_name, DeliveryModel, QueueParams};
use crate::redis::{
    load_properties, save_group, Heartbeat, QueueRegistration, RedisConsumer, RedisHandle, RedisStream, Workers,
};
use futures::TryStreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a dequeue loop waits after a store error before it tries
/// again.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

type Task = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Start = Box<dyn FnOnce(RedisStream, Context) -> Task + Send>;

struct Handler {
    queue: QueueParams,
    group: Option<String>,
    start: Start,
}

/// Consumes messages from any number of queues, one handler per
/// queue.
///
/// Register handlers with [`Consumer::consume`], then start
/// everything with [`Consumer::run`] and drive the returned [`Spawn`]:
///
/// ```no_run
/// # async fn example(redis: smq::redis::RedisHandle) -> smq::Result<()> {
/// use smq::{Consumer, Message, QueueParams};
///
/// let mut consumer = Consumer::build(redis).build();
/// consumer.consume(
///     QueueParams::new("billing", "invoices")?,
///     None,
///     tower::service_fn(|message: Message<String>| async move {
///         println!("{}", message.data);
///         Ok::<_, anyhow::Error>(())
///     }),
/// )?;
/// consumer.run().await?.wait().await
/// # }
/// ```
pub struct Consumer {
    redis: RedisHandle,
    consumer_id: String,
    config: ConsumerConfig,
    events: EventBus<ConsumerEvent>,
    workers: Option<Workers>,
    handlers: Vec<Handler>,
    /// Root of the token tree; every loop and the heartbeat stop when
    /// it is cancelled.
    shutdown: CancellationToken,
    queues: HashMap<QueueParams, CancellationToken>,
}

impl Consumer {
    pub fn build(redis: RedisHandle) -> ConsumerBuilder {
        ConsumerBuilder {
            config: redis.config().consumer,
            redis,
            events: EventBus::new(),
            worker_events: EventBus::new(),
            workers: true,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str { &self.consumer_id }

    #[must_use]
    pub fn events(&self) -> &EventBus<ConsumerEvent> { &self.events }

    /// Registers `service` as the handler of `queue`, replacing any
    /// previous handler of that queue.  Takes effect on the next
    /// [`Consumer::run`].
    ///
    /// For a pub/sub queue, `group` names the consumer group to
    /// consume from; it is created if needed.  Without one the
    /// consumer gets an ephemeral group of its own, which goes away
    /// with the consumer.  Point-to-point queues take no group.
    ///
    /// A message is acknowledged when the service returns `Ok`.  An
    /// error, a panic, an undecodable body, or exceeding the
    /// message's consume timeout unacknowledges it instead.
    pub fn consume<T, S>(&mut self, queue: QueueParams, group: Option<&str>, service: S) -> Result<()>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        S: tower::Service<Message<T>, Response = ()> + Send + 'static,
        S::Error: Into<anyhow::Error> + Send + 'static,
        S::Future: Send + 'static,
    {
        let group = group.map(validate_name).transpose()?;
        let start: Start = Box::new(move |stream: RedisStream, context: Context| -> Task {
            Box::pin(process_stream::<T, _, _>(stream, service, context))
        });

        self.handlers.retain(|handler| handler.queue != queue);
        self.handlers.push(Handler { queue, group, start });
        Ok(())
    }

    /// Resolves the consumer group of each handler.
    async fn registrations(&self, handlers: &[Handler]) -> Result<Vec<QueueRegistration>> {
        let mut conn = self.redis.shared().await?;
        let mut registrations = Vec::with_capacity(handlers.len());

        for handler in handlers {
            let queue = &handler.queue;
            let properties = load_properties(&mut conn, queue).await?;
            let (group, ephemeral) = match (properties.delivery_model, &handler.group) {
                (DeliveryModel::PointToPoint, None) => (None, false),
                (DeliveryModel::PointToPoint, Some(_)) => {
                    return Err(Error::ConsumerGroupsNotSupported { queue: queue.clone() })
                }
                (DeliveryModel::PubSub, Some(group)) => {
                    save_group(&mut conn, queue, group, None).await?;
                    (Some(group.clone()), false)
                }
                (DeliveryModel::PubSub, None) => {
                    save_group(&mut conn, queue, &self.consumer_id, Some(&self.consumer_id)).await?;
                    (Some(self.consumer_id.clone()), true)
                }
            };
            registrations.push(QueueRegistration {
                queue: queue.clone(),
                group,
                ephemeral,
            });
        }

        Ok(registrations)
    }

    /// Registers the consumer and starts its heartbeat, one dequeue
    /// loop per handler, and (unless disabled) the background
    /// workers.  Nothing runs until the returned [`Spawn`] is
    /// awaited.
    #[tracing::instrument(skip(self), fields(consumer_id = %self.consumer_id))]
    pub async fn run(&mut self) -> Result<Spawn> {
        let handlers = std::mem::take(&mut self.handlers);
        let registrations = self.registrations(&handlers).await?;

        let heartbeat = Heartbeat::register(self.redis.clone(), self.consumer_id.clone(), registrations.clone()).await?;

        let mut tasks: Vec<Task> = Vec::with_capacity(handlers.len() + 2);
        let interval = self.config.heartbeat_interval;
        let token = self.shutdown.child_token();
        tasks.push(Box::pin(async move {
            heartbeat.run(interval, token).await;
            Ok(())
        }));
        if let Some(workers) = self.workers.clone() {
            let token = self.shutdown.child_token();
            tasks.push(Box::pin(async move {
                workers.run(token).await;
                Ok(())
            }));
        }

        let provider = RedisConsumer::new(self.redis.clone(), self.events.clone(), self.shutdown.clone());
        for (handler, registration) in handlers.into_iter().zip(&registrations) {
            let stream = provider.stream(&self.consumer_id, registration).await?;
            let stop = self.shutdown.child_token();
            self.queues.insert(registration.queue.clone(), stop.clone());

            tasks.push((handler.start)(
                stream,
                Context {
                    consumer_id: self.consumer_id.clone(),
                    poll_timeout: self.config.poll_timeout,
                    events: self.events.clone(),
                    stop,
                    shutdown: self.shutdown.clone(),
                },
            ));
        }

        tracing::info!(queues = registrations.len(), "consumer up");
        self.events.emit(ConsumerEvent::Up {
            consumer_id: self.consumer_id.clone(),
        });

        Ok(Spawn {
            tasks,
            shutdown: self.shutdown.clone(),
            stop: Box::pin(futures::future::pending()),
            consumer_id: self.consumer_id.clone(),
            events: self.events.clone(),
        })
    }

    /// Stops dequeuing from `queue`.  A message being handled is
    /// still acknowledged or unacknowledged.  Returns whether the
    /// queue was being consumed.
    pub fn cancel(&mut self, queue: &QueueParams) -> bool {
        match self.queues.remove(queue) {
            Some(token) => {
                token.cancel();
                tracing::info!(consumer_id = %self.consumer_id, %queue, "consumption cancelled");
                true
            }
            None => false,
        }
    }

    /// Stops everything: dequeuing, the heartbeat, and the workers.
    /// Messages held at this point are abandoned; once the heartbeat
    /// goes stale, a watchdog returns them to their queues.
    pub fn shutdown(&self) {
        tracing::info!(consumer_id = %self.consumer_id, "consumer shutting down");
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("consumer_id", &self.consumer_id)
            .field("config", &self.config)
            .field("handlers", &self.handlers.len())
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Context {
    consumer_id: String,
    poll_timeout: Duration,
    events: EventBus<ConsumerEvent>,
    /// Stops the dequeue loop between messages.
    stop: CancellationToken,
    /// Also abandons the message being handled.
    shutdown: CancellationToken,
}

impl Context {
    fn report(&self, error: &Error) {
        tracing::error!(consumer_id = %self.consumer_id, %error, "consumer error");
        self.events.emit(ConsumerEvent::Error {
            consumer_id: self.consumer_id.clone(),
            error: error.to_string(),
        });
    }

    /// Store errors are reported and retried after a pause; anything
    /// else stops the loop.
    async fn recover(&self, error: Error) -> Result<()> {
        self.report(&error);
        if !error.is_store_error() {
            return Err(error);
        }
        tokio::select! {
            () = self.stop.cancelled() => {}
            () = tokio::time::sleep(RETRY_PAUSE) => {}
        }
        Ok(())
    }
}

#[tracing::instrument(skip_all, name = "queue.poll", fields(consumer_id = %context.consumer_id))]
async fn process_stream<T, C, S>(stream: C, mut service: S, context: Context) -> Result<()>
where
    T: serde::de::DeserializeOwned + Send + 'static,
    C: ConsumerStream<Error = Error>,
    S: tower::Service<Message<T>, Response = ()> + Send,
    S::Error: Into<anyhow::Error> + Send + 'static,
    S::Future: Send + 'static,
{
    let mut stream = std::pin::pin!(stream);

    while !context.stop.is_cancelled() {
        let envelope = match stream.as_mut().next(context.poll_timeout).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(error) => {
                context.recover(error).await?;
                continue;
            }
        };

        if context.shutdown.is_cancelled() {
            // dequeued while shutting down; the watchdog returns it.
            break;
        }

        if let Err(error) = process_message(stream.as_mut(), &mut service, &context, envelope).await {
            context.recover(error).await?;
        }
    }

    tracing::debug!("dequeue loop stopped");
    Ok(())
}

async fn process_message<T, C, S>(
    mut stream: Pin<&mut C>,
    service: &mut S,
    context: &Context,
    envelope: MessageEnvelope,
) -> Result<()>
where
    T: serde::de::DeserializeOwned + Send + 'static,
    C: ConsumerStream<Error = Error>,
    S: tower::Service<Message<T>, Response = ()>,
    S::Error: Into<anyhow::Error> + Send + 'static,
    S::Future: Send + 'static,
{
    if envelope.is_expired(crate::redis::now()) {
        return stream.unack(&envelope, UnackCause::TtlExpired).await;
    }

    let data = match serde_json::from_value::<T>(envelope.message.body.clone()) {
        Ok(data) => data,
        Err(error) => {
            let cause = UnackCause::HandlerError(format!("could not deserialize message body: {error}"));
            return stream.unack(&envelope, cause).await;
        }
    };
    if let Err(error) = std::future::poll_fn(|cx| service.poll_ready(cx)).await {
        return stream.unack(&envelope, handler_error(error)).await;
    }

    let mut task = tokio::spawn(service.call(Message::new(&envelope, data)));
    let timeout = envelope.message.consume_timeout;
    let deadline = std::pin::pin!(async move {
        if timeout == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_millis(timeout)).await;
        }
    });

    let cause = tokio::select! {
        result = &mut task => match result {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(handler_error(error)),
            Err(error) => Some(UnackCause::HandlerError(error.to_string())),
        },
        () = deadline => {
            task.abort();
            Some(UnackCause::Timeout)
        }
        () = context.shutdown.cancelled() => {
            task.abort();
            tracing::debug!(message_id = %envelope.id(), "abandoned message on shutdown");
            return Ok(());
        }
    };

    match cause {
        None => stream.ack(&envelope).await,
        Some(cause) => stream.unack(&envelope, cause).await,
    }
}

fn handler_error<E: Into<anyhow::Error>>(error: E) -> UnackCause {
    UnackCause::HandlerError(format!("{:#}", error.into()))
}

/// The running consumer.  Awaiting [`Spawn::wait`] drives every loop
/// and resolves once they all stopped.
#[must_use]
pub struct Spawn {
    tasks: Vec<Task>,
    shutdown: CancellationToken,
    stop: Pin<Box<dyn Future<Output = ()> + Send>>,
    consumer_id: String,
    events: EventBus<ConsumerEvent>,
}

impl Spawn {
    /// Shuts the consumer down once `future` resolves.
    pub fn with_graceful_shutdown<F>(self, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            stop: Box::pin(future),
            ..self
        }
    }

    /// A handle that shuts the consumer down when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    pub async fn wait(self) -> Result<()> {
        let Self {
            tasks,
            shutdown,
            stop,
            consumer_id,
            events,
        } = self;

        let mut tasks = futures::stream::FuturesUnordered::from_iter(tasks).try_collect::<()>();
        let result = tokio::select! {
            result = &mut tasks => result,
            () = stop => {
                shutdown.cancel();
                tasks.await
            }
        };

        // a failed loop takes the others down with it.
        shutdown.cancel();
        if let Err(error) = &result {
            tracing::error!(%consumer_id, %error, "consumer stopped on error");
        }
        tracing::info!(%consumer_id, "consumer down");
        events.emit(ConsumerEvent::Down { consumer_id });
        result
    }
}

impl std::fmt::Debug for Spawn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawn")
            .field("consumer_id", &self.consumer_id)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageStatus, ProducibleMessage};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Outcome {
        Ack,
        Unack(UnackCause),
    }

    /// Hands out queued envelopes, then stops the loop.
    struct FakeStream {
        envelopes: VecDeque<MessageEnvelope>,
        outcomes: Arc<Mutex<Vec<Outcome>>>,
        stop: CancellationToken,
    }

    #[async_trait::async_trait]
    impl ConsumerStream for FakeStream {
        type Error = Error;

        async fn next(mut self: Pin<&mut Self>, _timeout: Duration) -> Result<Option<MessageEnvelope>> {
            let next = self.envelopes.pop_front();
            if next.is_none() {
                self.stop.cancel();
            }
            Ok(next)
        }

        async fn ack(self: Pin<&mut Self>, _envelope: &MessageEnvelope) -> Result<()> {
            self.outcomes.lock().expect("lock").push(Outcome::Ack);
            Ok(())
        }

        async fn unack(self: Pin<&mut Self>, _envelope: &MessageEnvelope, cause: UnackCause) -> Result<()> {
            self.outcomes.lock().expect("lock").push(Outcome::Unack(cause));
            Ok(())
        }
    }

    fn envelope(message: ProducibleMessage) -> MessageEnvelope {
        let queue = QueueParams::new("test", "jobs").expect("queue");
        let mut envelope = MessageEnvelope::new(message, queue, None, MessageStatus::Processing);
        envelope.state.published_at = Some(crate::redis::now());
        envelope
    }

    async fn drive<S>(envelopes: Vec<MessageEnvelope>, service: S) -> Vec<Outcome>
    where
        S: tower::Service<Message<u32>, Response = ()> + Send,
        S::Error: Into<anyhow::Error> + Send + 'static,
        S::Future: Send + 'static,
    {
        let outcomes = Arc::new(Mutex::new(vec![]));
        let stop = CancellationToken::new();
        let stream = FakeStream {
            envelopes: envelopes.into(),
            outcomes: outcomes.clone(),
            stop: stop.clone(),
        };
        let context = Context {
            consumer_id: "c1".to_owned(),
            poll_timeout: Duration::from_millis(10),
            events: EventBus::new(),
            stop,
            shutdown: CancellationToken::new(),
        };

        process_stream::<u32, _, _>(stream, service, context)
            .await
            .expect("process");
        let outcomes = outcomes.lock().expect("lock").clone();
        outcomes
    }

    #[tokio::test]
    async fn acknowledges_successful_messages() {
        let message = ProducibleMessage::new(&7).expect("message");
        let outcomes = drive(
            vec![envelope(message)],
            tower::service_fn(|message: Message<u32>| async move {
                assert_eq!(message.data, 7);
                Ok::<_, anyhow::Error>(())
            }),
        )
        .await;

        assert_eq!(outcomes, vec![Outcome::Ack]);
    }

    #[tokio::test]
    async fn handler_errors_unacknowledge() {
        let message = ProducibleMessage::new(&7).expect("message");
        let outcomes = drive(
            vec![envelope(message)],
            tower::service_fn(|_: Message<u32>| async move { Err::<(), _>(anyhow::anyhow!("db down")) }),
        )
        .await;

        assert_eq!(
            outcomes,
            vec![Outcome::Unack(UnackCause::HandlerError("db down".to_owned()))]
        );
    }

    #[tokio::test]
    async fn slow_handlers_time_out() {
        let message = ProducibleMessage::new(&7)
            .expect("message")
            .with_consume_timeout(Duration::from_millis(20));
        let outcomes = drive(
            vec![envelope(message)],
            tower::service_fn(|_: Message<u32>| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, anyhow::Error>(())
            }),
        )
        .await;

        assert_eq!(outcomes, vec![Outcome::Unack(UnackCause::Timeout)]);
    }

    #[tokio::test]
    async fn expired_and_undecodable_messages_skip_the_handler() {
        let mut expired = envelope(
            ProducibleMessage::new(&7)
                .expect("message")
                .with_ttl(Duration::from_millis(10)),
        );
        expired.state.published_at = Some(crate::redis::now() - 1_000);
        let undecodable = envelope(ProducibleMessage::new(&"not a number").expect("message"));

        let outcomes = drive(
            vec![expired, undecodable],
            tower::service_fn(|_: Message<u32>| async move { Err::<(), _>(anyhow::anyhow!("handler ran")) }),
        )
        .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0], Outcome::Unack(UnackCause::TtlExpired));
        assert!(matches!(
            &outcomes[1],
            Outcome::Unack(UnackCause::HandlerError(reason)) if reason.starts_with("could not deserialize")
        ));
    }
}
