//! These tests need a Redis server (6.2 or later) at `REDIS_URL`, or
//! `redis://127.0.0.1/0` by default.  Every test works on queues of
//! its own, so they can run in parallel against the same database.

use rand::Rng as _;
use smq::config::{ConsumerConfig, WorkerConfig};
use smq::events::ConsumerEvent;
use smq::message::{MessageStatus, UnackCause};
use smq::queue::{MessageSet, Operation, RateLimit};
use smq::redis::{
    ConsumerGroups, Exchanges, Messages, QueueCounts, QueueManager, RateLimiter, RedisHandle, RedisProducer, Workers,
};
use smq::{
    Config, Consumer, DeliveryModel, Error, ExchangeKind, ExchangeParams, Message, MessageId, MessagePriority,
    ProducerProvider as _, ProducibleMessage, QueueParams, QueueState, QueueType,
};
use redis::AsyncCommands as _;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Notify};
use tower::service_fn;

const NAMESPACE: &str = "smq-tests";
const DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
struct Task {
    count: u64,
}

fn config() -> Config {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/0".to_owned());
    Config::default()
        .with_namespace(NAMESPACE)
        .with_redis_url(url)
        .with_consumer(ConsumerConfig {
            heartbeat_interval: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(200),
            priority_poll_interval: Duration::from_millis(20),
            ..ConsumerConfig::default()
        })
        .with_workers(WorkerConfig {
            scheduler_interval: Duration::from_millis(50),
            delayed_interval: Duration::from_millis(50),
            ..WorkerConfig::default()
        })
}

fn connect() -> RedisHandle {
    // `RUST_LOG=smq=debug` shows what the consumers do.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    RedisHandle::new(config()).expect("redis handle")
}

fn random_name(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{prefix}-{}", suffix.to_ascii_lowercase())
}

async fn create_queue(redis: &RedisHandle, queue_type: QueueType, delivery_model: DeliveryModel) -> QueueParams {
    let queue = QueueParams::new(NAMESPACE, &random_name("queue")).expect("queue params");
    let created = QueueManager::new(redis.clone())
        .save(&queue, queue_type, delivery_model)
        .await
        .expect("save queue");
    assert!(created);
    queue
}

fn task(queue: &QueueParams, count: u64) -> ProducibleMessage {
    ProducibleMessage::new(&Task { count })
        .expect("message")
        .to_queue(queue.clone())
}

async fn produce(producer: &RedisProducer, message: ProducibleMessage) -> MessageId {
    let mut ids = producer.produce(message).await.expect("produce");
    assert_eq!(ids.len(), 1);
    ids.remove(0)
}

/// A handler forwarding every task it sees.
fn forward(
    tx: mpsc::UnboundedSender<Task>,
) -> impl tower::Service<
    Message<Task>,
    Response = (),
    Error = Infallible,
    Future = impl std::future::Future<Output = Result<(), Infallible>> + Send + 'static,
> + Send
       + 'static {
    service_fn(move |message: Message<Task>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.data);
            Ok::<_, Infallible>(())
        }
    })
}

async fn receive<T>(rx: &mut mpsc::UnboundedReceiver<T>, count: usize) -> Vec<T> {
    tokio::time::timeout(DEADLINE, async {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            out.push(rx.recv().await.expect("handler dropped"));
        }
        out
    })
    .await
    .expect("timed out waiting for messages")
}

/// Waits until `count` events matched.
async fn events<F>(rx: &mut broadcast::Receiver<ConsumerEvent>, count: usize, matches: F) -> Vec<ConsumerEvent>
where
    F: Fn(&ConsumerEvent) -> bool,
{
    tokio::time::timeout(DEADLINE, async {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            match rx.recv().await {
                Ok(event) if matches(&event) => out.push(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
        out
    })
    .await
    .expect("timed out waiting for events")
}

fn acknowledged(event: &ConsumerEvent) -> bool { matches!(event, ConsumerEvent::MessageAcknowledged { .. }) }

/// A consumer running in the background.
struct Running {
    shutdown: tokio_util::sync::CancellationToken,
    task: tokio::task::JoinHandle<smq::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(DEADLINE, self.task)
            .await
            .expect("consumer did not stop")
            .expect("consumer panicked")
            .expect("consumer failed");
    }
}

async fn start(consumer: &mut Consumer) -> Running {
    let spawn = consumer.run().await.expect("run");
    Running {
        shutdown: spawn.shutdown_token(),
        task: tokio::spawn(spawn.wait()),
    }
}

fn consumer(redis: &RedisHandle) -> Consumer { Consumer::build(redis.clone()).with_workers(false).build() }

/// A watchdog that gives up on consumers after 1.5s of silence.
fn impatient_workers() -> Workers {
    let redis = RedisHandle::new(config().with_consumer(ConsumerConfig {
        liveness_threshold: Duration::from_millis(1500),
        ..ConsumerConfig::default()
    }))
    .expect("redis handle");
    Workers::new(redis)
}

/// A plain connection, for looking at keys directly.
async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open(config().redis_url.as_str())
        .expect("client")
        .get_multiplexed_async_connection()
        .await
        .expect("connection")
}

/// Polls the counts of `queue` until `done` accepts them.
async fn wait_for_counts<F>(messages: &Messages, queue: &QueueParams, done: F) -> QueueCounts
where
    F: Fn(&QueueCounts) -> bool,
{
    tokio::time::timeout(DEADLINE, async {
        loop {
            let counts = messages.count_by_status(queue).await.expect("counts");
            if done(&counts) {
                return counts;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("timed out waiting for counts")
}

#[tokio::test]
async fn fifo_queues_deliver_in_publish_order() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());

    for count in 0..100 {
        produce(&producer, task(&queue, count)).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = consumer(&redis);
    let mut bus = consumer.events().subscribe();
    consumer.consume(queue.clone(), None, forward(tx)).expect("consume");
    let running = start(&mut consumer).await;

    let seen = receive(&mut rx, 100).await;
    events(&mut bus, 100, acknowledged).await;
    running.stop().await;

    assert_eq!(seen.iter().map(|task| task.count).collect::<Vec<_>>(), (0..100).collect::<Vec<_>>());
    let counts = Messages::new(redis).count_by_status(&queue).await.expect("counts");
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.processing, 0);
    assert_eq!(counts.acknowledged, 100);
}

#[tokio::test]
async fn lifo_queues_deliver_newest_first() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Lifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());

    for count in 0..4 {
        produce(&producer, task(&queue, count)).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = consumer(&redis);
    consumer.consume(queue, None, forward(tx)).expect("consume");
    let running = start(&mut consumer).await;
    let seen = receive(&mut rx, 4).await;
    running.stop().await;

    assert_eq!(seen.iter().map(|task| task.count).collect::<Vec<_>>(), vec![3, 2, 1, 0]);
}

#[tokio::test]
async fn priority_queues_deliver_by_priority() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Priority, DeliveryModel::PointToPoint).await;
    let fifo = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());

    let missing = producer.produce(task(&queue, 0)).await;
    assert!(matches!(missing, Err(Error::PriorityRequired { .. })));
    let unsupported = producer
        .produce(task(&fifo, 0).with_priority(MessagePriority::High))
        .await;
    assert!(matches!(unsupported, Err(Error::PriorityNotSupported { .. })));

    let priorities = [
        (1, MessagePriority::Low),
        (2, MessagePriority::Highest),
        (3, MessagePriority::Normal),
        (4, MessagePriority::Highest),
    ];
    for (count, priority) in priorities {
        produce(&producer, task(&queue, count).with_priority(priority)).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = consumer(&redis);
    consumer.consume(queue, None, forward(tx)).expect("consume");
    let running = start(&mut consumer).await;
    let seen = receive(&mut rx, 4).await;
    running.stop().await;

    // equal priorities keep their publish order.
    assert_eq!(seen.iter().map(|task| task.count).collect::<Vec<_>>(), vec![2, 4, 3, 1]);
}

#[tokio::test]
async fn failing_messages_are_retried_then_dead_lettered() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());
    let id = produce(
        &producer,
        task(&queue, 7)
            .with_retry_threshold(2)
            .with_retry_delay(Duration::ZERO),
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = consumer(&redis);
    let mut bus = consumer.events().subscribe();
    consumer
        .consume(
            queue.clone(),
            None,
            service_fn(move |message: Message<Task>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message.attempts);
                    Err::<(), _>(anyhow::anyhow!("attempt {} failed", message.attempts))
                }
            }),
        )
        .expect("consume");
    let running = start(&mut consumer).await;

    let dead = events(&mut bus, 1, |event| matches!(event, ConsumerEvent::MessageDeadLettered { .. })).await;
    running.stop().await;

    assert_eq!(receive(&mut rx, 3).await, vec![0, 1, 2]);
    match &dead[0] {
        ConsumerEvent::MessageDeadLettered { id: dead_id, cause, .. } => {
            assert_eq!(dead_id, &id);
            assert!(matches!(cause, UnackCause::HandlerError(reason) if reason.contains("attempt 2 failed")));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let messages = Messages::new(redis);
    let envelope = messages.get(&id).await.expect("get");
    assert_eq!(envelope.status(), MessageStatus::DeadLettered);
    assert_eq!(envelope.state.attempts, 3);
    let counts = messages.count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.pending, counts.dead_lettered), (0, 1));
}

#[tokio::test]
async fn delayed_retries_come_back_through_the_workers() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());
    produce(
        &producer,
        task(&queue, 1)
            .with_retry_threshold(1)
            .with_retry_delay(Duration::from_millis(300)),
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = Consumer::build(redis.clone()).build();
    let mut bus = consumer.events().subscribe();
    consumer
        .consume(
            queue.clone(),
            None,
            service_fn(move |message: Message<Task>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((message.attempts, Instant::now()));
                    if message.attempts == 0 {
                        Err(anyhow::anyhow!("first attempt fails"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .expect("consume");
    let running = start(&mut consumer).await;

    let seen = receive(&mut rx, 2).await;
    events(&mut bus, 1, acknowledged).await;
    running.stop().await;

    assert_eq!((seen[0].0, seen[1].0), (0, 1));
    assert!(seen[1].1 - seen[0].1 >= Duration::from_millis(300));
    let counts = Messages::new(redis).count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.delayed, counts.acknowledged), (0, 1));
}

#[tokio::test]
async fn slow_handlers_time_out() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());
    let id = produce(
        &producer,
        task(&queue, 1)
            .with_retry_threshold(0)
            .with_consume_timeout(Duration::from_millis(100)),
    )
    .await;

    let mut consumer = consumer(&redis);
    let mut bus = consumer.events().subscribe();
    consumer
        .consume(
            queue,
            None,
            service_fn(|_: Message<Task>| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Infallible>(())
            }),
        )
        .expect("consume");
    let running = start(&mut consumer).await;
    let dead = events(&mut bus, 1, |event| matches!(event, ConsumerEvent::MessageDeadLettered { .. })).await;
    running.stop().await;

    assert!(matches!(
        &dead[0],
        ConsumerEvent::MessageDeadLettered { id: dead_id, cause: UnackCause::Timeout, .. } if *dead_id == id
    ));
}

#[tokio::test]
async fn watchdog_recovers_messages_of_dead_consumers() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());
    let id = produce(&producer, task(&queue, 1).with_retry_delay(Duration::ZERO)).await;

    let mut consumer = consumer(&redis);
    let mut bus = consumer.events().subscribe();
    consumer
        .consume(
            queue.clone(),
            None,
            service_fn(|_: Message<Task>| futures::future::pending::<Result<(), Infallible>>()),
        )
        .expect("consume");
    let running = start(&mut consumer).await;
    events(&mut bus, 1, |event| matches!(event, ConsumerEvent::MessageReceived { .. })).await;
    // shutting down abandons the message in the consumer's hands.
    running.stop().await;

    let messages = Messages::new(redis.clone());
    let counts = messages.count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.pending, counts.processing), (0, 1));

    tokio::time::sleep(Duration::from_secs(2)).await;
    impatient_workers().tick().await.expect("tick");

    let counts = messages.count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.pending, counts.processing), (1, 0));
    let envelope = messages.get(&id).await.expect("get");
    assert_eq!(envelope.status(), MessageStatus::UnackRequeuing);
    assert_eq!(envelope.state.attempts, 1);
    assert_eq!(envelope.state.last_unack_cause, Some(UnackCause::OfflineConsumer));
}

#[tokio::test]
async fn rate_limits_spread_deliveries_over_windows() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let limiter = RateLimiter::new(redis.clone());
    let rate_limit = RateLimit::new(2, 1_000).expect("rate limit");
    limiter.set(&queue, rate_limit).await.expect("set rate limit");
    assert_eq!(limiter.get(&queue).await.expect("get rate limit"), Some(rate_limit));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = consumer(&redis);
    consumer
        .consume(
            queue.clone(),
            None,
            service_fn(move |_: Message<Task>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(Instant::now());
                    Ok::<_, Infallible>(())
                }
            }),
        )
        .expect("consume");
    let running = start(&mut consumer).await;

    // publish at the start of a window, so the first burst is a full one.
    let now = chrono::Utc::now().timestamp_millis();
    tokio::time::sleep(Duration::from_millis(rate_limit.until_next_window(now) + 20)).await;
    let producer = RedisProducer::new(redis.clone());
    for count in 0..6 {
        produce(&producer, task(&queue, count)).await;
    }
    let delivered = receive(&mut rx, 6).await;
    running.stop().await;

    let mut bursts: Vec<Vec<Instant>> = vec![];
    for at in delivered {
        match bursts.last_mut() {
            Some(burst) if at - burst[burst.len() - 1] < Duration::from_millis(500) => burst.push(at),
            _ => bursts.push(vec![at]),
        }
    }
    assert_eq!(bursts.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 2]);
    for pair in bursts.windows(2) {
        assert!(pair[1][0] - pair[0][0] >= Duration::from_millis(900));
    }

    assert!(limiter.clear(&queue).await.expect("clear"));
    assert_eq!(limiter.get(&queue).await.expect("get rate limit"), None);
}

#[tokio::test]
async fn scheduled_messages_fire_and_repeat() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());
    let messages = Messages::new(redis.clone());

    let published = Instant::now();
    let scheduled = produce(
        &producer,
        task(&queue, 9)
            .with_schedule_delay(Duration::from_millis(300))
            .with_schedule_repeat(2, Duration::from_millis(100)),
    )
    .await;
    let counts = messages.count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.pending, counts.scheduled), (0, 1));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = Consumer::build(redis.clone()).build();
    let mut bus = consumer.events().subscribe();
    consumer.consume(queue.clone(), None, forward(tx)).expect("consume");
    let running = start(&mut consumer).await;

    receive(&mut rx, 1).await;
    assert!(published.elapsed() >= Duration::from_millis(300));
    receive(&mut rx, 2).await;
    let acked = events(&mut bus, 3, acknowledged).await;
    running.stop().await;

    for event in acked {
        let ConsumerEvent::MessageAcknowledged { id, .. } = event else {
            unreachable!()
        };
        let envelope = messages.get(&id).await.expect("get");
        assert_eq!(envelope.state.parent_id.as_ref(), Some(&scheduled));
    }
    // an exhausted schedule is removed.
    assert!(matches!(messages.get(&scheduled).await, Err(Error::MessageNotFound { .. })));
    let counts = messages.count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.scheduled, counts.acknowledged), (0, 3));
}

#[tokio::test]
async fn invalid_schedules_are_rejected() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis);

    let result = producer
        .produce(task(&queue, 1).with_schedule_cron("not a cron expression"))
        .await;
    assert!(matches!(result, Err(Error::InvalidSchedule { .. })));
}

#[tokio::test]
async fn pub_sub_queues_copy_messages_to_every_group() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PubSub).await;
    let producer = RedisProducer::new(redis.clone());
    let groups = ConsumerGroups::new(redis.clone());

    let result = producer.produce(task(&queue, 1)).await;
    assert!(matches!(result, Err(Error::NoConsumerGroups { .. })));

    assert!(groups.save(&queue, "billing").await.expect("save group"));
    assert!(groups.save(&queue, "audit").await.expect("save group"));
    assert!(!groups.save(&queue, "audit").await.expect("save group"));
    assert_eq!(groups.list(&queue).await.expect("groups"), vec!["audit", "billing"]);

    let ids = producer.produce(task(&queue, 1)).await.expect("produce");
    assert_eq!(ids.len(), 2);

    let mut running = Vec::new();
    let mut receivers = Vec::new();
    for group in ["billing", "audit"] {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut consumer = consumer(&redis);
        consumer.consume(queue.clone(), Some(group), forward(tx)).expect("consume");
        running.push(start(&mut consumer).await);
        receivers.push(rx);
    }
    for rx in &mut receivers {
        assert_eq!(receive(rx, 1).await, vec![Task { count: 1 }]);
    }
    for consumer in running {
        consumer.stop().await;
    }

    let pending = Messages::new(redis.clone()).list(&queue, MessageSet::Pending { group: None }, 1, 10).await;
    assert!(matches!(pending, Err(Error::ConsumerGroupRequired { .. })));

    let point_to_point = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let mut consumer = consumer(&redis);
    consumer
        .consume(point_to_point, Some("billing"), forward(mpsc::unbounded_channel().0))
        .expect("consume");
    assert!(matches!(
        consumer.run().await,
        Err(Error::ConsumerGroupsNotSupported { .. })
    ));
}

#[tokio::test]
async fn exchanges_route_by_kind() {
    let redis = connect();
    let exchanges = Exchanges::new(redis.clone());
    let producer = RedisProducer::new(redis.clone());
    let messages = Messages::new(redis.clone());
    let orders = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let invoices = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let direct = ExchangeParams::new(NAMESPACE, &random_name("direct")).expect("exchange");
    assert!(exchanges.save(&direct, ExchangeKind::Direct).await.expect("save"));
    exchanges.bind(&direct, &orders, Some("orders")).await.expect("bind");
    exchanges.bind(&direct, &invoices, Some("invoices")).await.expect("bind");

    let message = ProducibleMessage::new(&Task { count: 1 }).expect("message");
    let ids = producer
        .produce(message.clone().to_exchange(direct.clone(), Some("orders".to_owned())))
        .await
        .expect("produce");
    assert_eq!(ids.len(), 1);
    assert_eq!(messages.get(&ids[0]).await.expect("get").queue, orders);

    let unmatched = producer
        .produce(message.clone().to_exchange(direct.clone(), Some("refunds".to_owned())))
        .await;
    assert!(matches!(unmatched, Err(Error::NoMatchingQueues)));

    let topic = ExchangeParams::new(NAMESPACE, &random_name("topic")).expect("exchange");
    exchanges.save(&topic, ExchangeKind::Topic).await.expect("save");
    exchanges.bind(&topic, &orders, Some("orders.*")).await.expect("bind");
    exchanges.bind(&topic, &invoices, Some("#.eu")).await.expect("bind");
    let ids = producer
        .produce(message.clone().to_exchange(topic.clone(), Some("orders.eu".to_owned())))
        .await
        .expect("produce");
    assert_eq!(ids.len(), 2);

    let fan_out = ExchangeParams::new(NAMESPACE, &random_name("fanout")).expect("exchange");
    exchanges.save(&fan_out, ExchangeKind::FanOut).await.expect("save");
    exchanges.bind(&fan_out, &orders, None).await.expect("bind");
    exchanges.bind(&fan_out, &invoices, None).await.expect("bind");
    let ids = producer
        .produce(message.to_exchange(fan_out.clone(), None))
        .await
        .expect("produce");
    assert_eq!(ids.len(), 2);
    assert_eq!(exchanges.bound_queues(&fan_out).await.expect("bindings").len(), 2);

    // every queue bound to an exchange shares one queue type.
    let priority = create_queue(&redis, QueueType::Priority, DeliveryModel::PointToPoint).await;
    assert!(matches!(
        exchanges.bind(&fan_out, &priority, None).await,
        Err(Error::ExchangeQueueTypeMismatch { .. })
    ));

    assert!(matches!(
        exchanges.save(&fan_out, ExchangeKind::Direct).await,
        Err(Error::ExchangeKindMismatch { .. })
    ));
    assert!(matches!(
        exchanges.delete(&fan_out).await,
        Err(Error::ExchangeHasBindings { .. })
    ));
    assert!(exchanges.unbind(&fan_out, &orders, None).await.expect("unbind"));
    assert!(exchanges.unbind(&fan_out, &invoices, None).await.expect("unbind"));
    exchanges.delete(&fan_out).await.expect("delete exchange");
    assert!(!exchanges.list(NAMESPACE).await.expect("list").contains(&fan_out));

    let counts = messages.count_by_status(&orders).await.expect("counts");
    assert_eq!(counts.pending, 3);
}

#[tokio::test]
async fn queue_states_gate_operations() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let manager = QueueManager::new(redis.clone());
    let producer = RedisProducer::new(redis.clone());

    manager.set_state(&queue, QueueState::Paused).await.expect("pause");
    produce(&producer, task(&queue, 1)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = consumer(&redis);
    consumer.consume(queue.clone(), None, forward(tx)).expect("consume");
    let running = start(&mut consumer).await;

    let paused = tokio::time::timeout(Duration::from_millis(600), rx.recv()).await;
    assert!(paused.is_err(), "paused queue delivered a message");
    manager.set_state(&queue, QueueState::Active).await.expect("resume");
    assert_eq!(receive(&mut rx, 1).await, vec![Task { count: 1 }]);
    running.stop().await;

    manager.set_state(&queue, QueueState::Stopped).await.expect("stop");
    assert!(matches!(
        producer.produce(task(&queue, 2)).await,
        Err(Error::OperationNotPermitted {
            operation: Operation::Produce,
            state: QueueState::Stopped,
            ..
        })
    ));

    manager.set_state(&queue, QueueState::Locked).await.expect("lock");
    assert!(matches!(
        RateLimiter::new(redis.clone())
            .set(&queue, RateLimit::new(1, 1_000).expect("rate limit"))
            .await,
        Err(Error::OperationNotPermitted { .. })
    ));
    manager.set_state(&queue, QueueState::Active).await.expect("unlock");
    assert_eq!(
        manager.get_properties(&queue).await.expect("properties").state,
        QueueState::Active
    );
}

#[tokio::test]
async fn queues_are_only_deleted_once_drained() {
    let redis = connect();
    let manager = QueueManager::new(redis.clone());
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;

    assert!(!manager
        .save(&queue, QueueType::Fifo, DeliveryModel::PointToPoint)
        .await
        .expect("save again"));
    assert!(matches!(
        manager.save(&queue, QueueType::Lifo, DeliveryModel::PointToPoint).await,
        Err(Error::QueueExists { .. })
    ));
    assert!(manager.list(Some(NAMESPACE)).await.expect("list").contains(&queue));

    let producer = RedisProducer::new(redis.clone());
    produce(&producer, task(&queue, 1)).await;
    produce(&producer, task(&queue, 2)).await;
    assert!(matches!(manager.delete(&queue).await, Err(Error::QueueNotEmpty { .. })));

    let purged = manager
        .purge(&queue, MessageSet::Pending { group: None })
        .await
        .expect("purge");
    assert_eq!(purged, 2);
    manager.delete(&queue).await.expect("delete");
    assert!(!manager.exists(&queue).await.expect("exists"));
    assert!(matches!(
        manager.get_properties(&queue).await,
        Err(Error::QueueNotFound { .. })
    ));
}

#[tokio::test]
async fn dead_letters_can_be_requeued_once() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());
    let messages = Messages::new(redis.clone());
    let id = produce(&producer, task(&queue, 5).with_retry_threshold(0)).await;

    assert!(matches!(
        messages.requeue(&queue, &id).await,
        Err(Error::MessageNotRequeuable { .. })
    ));

    let mut consumer = consumer(&redis);
    let mut bus = consumer.events().subscribe();
    consumer
        .consume(
            queue.clone(),
            None,
            service_fn(|_: Message<Task>| async { Err::<(), _>(anyhow::anyhow!("rejected")) }),
        )
        .expect("consume");
    let running = start(&mut consumer).await;
    events(&mut bus, 1, |event| matches!(event, ConsumerEvent::MessageDeadLettered { .. })).await;
    running.stop().await;

    let page = messages
        .list(&queue, MessageSet::DeadLettered, 1, 10)
        .await
        .expect("list");
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id(), &id);

    let copy = messages.requeue(&queue, &id).await.expect("requeue");
    assert_ne!(copy, id);
    assert!(matches!(
        messages.requeue(&queue, &id).await,
        Err(Error::MessageNotRequeuable { .. })
    ));

    let original = messages.get(&id).await.expect("get");
    assert_eq!(original.state.requeued_message_id.as_ref(), Some(&copy));
    let requeued = messages.get(&copy).await.expect("get");
    assert_eq!(requeued.status(), MessageStatus::Pending);
    assert_eq!(requeued.state.parent_id.as_ref(), Some(&id));
    assert_eq!(requeued.state.attempts, 0);

    let missing = MessageId::new("missing");
    let report = messages
        .delete(&queue, &[copy.clone(), missing.clone()])
        .await
        .expect("delete");
    assert_eq!(report.processed, vec![copy.clone(), missing.clone()]);
    assert_eq!(report.success, vec![copy]);
    assert_eq!(report.not_found, vec![missing]);
    assert!(report.in_process.is_empty());

    let counts = messages.count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.pending, counts.dead_lettered), (0, 1));
}

#[tokio::test]
async fn point_to_point_messages_go_to_exactly_one_consumer() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());
    let messages = Messages::new(redis.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut running = Vec::new();
    for _ in 0..4 {
        let mut consumer = consumer(&redis);
        consumer.consume(queue.clone(), None, forward(tx.clone())).expect("consume");
        running.push(start(&mut consumer).await);
    }
    drop(tx);

    for count in 0..40 {
        produce(&producer, task(&queue, count)).await;
    }
    let seen = receive(&mut rx, 40).await;
    wait_for_counts(&messages, &queue, |counts| counts.acknowledged == 40).await;
    for consumer in running {
        consumer.stop().await;
    }

    let mut delivered = seen.iter().map(|task| task.count).collect::<Vec<_>>();
    delivered.sort_unstable();
    assert_eq!(delivered, (0..40).collect::<Vec<_>>());
    assert!(rx.try_recv().is_err(), "a message was delivered twice");
    let counts = messages.count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.pending, counts.processing, counts.acknowledged), (0, 0, 40));
}

#[tokio::test]
async fn consumers_sharing_a_group_split_its_messages() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PubSub).await;
    let groups = ConsumerGroups::new(redis.clone());
    groups.save(&queue, "workers").await.expect("save group");
    groups.save(&queue, "audit").await.expect("save group");

    let (workers_tx, mut workers_rx) = mpsc::unbounded_channel();
    let (audit_tx, mut audit_rx) = mpsc::unbounded_channel();
    let mut running = Vec::new();
    for _ in 0..2 {
        let mut consumer = consumer(&redis);
        consumer
            .consume(queue.clone(), Some("workers"), forward(workers_tx.clone()))
            .expect("consume");
        running.push(start(&mut consumer).await);
    }
    drop(workers_tx);
    let mut auditor = consumer(&redis);
    auditor.consume(queue.clone(), Some("audit"), forward(audit_tx)).expect("consume");
    running.push(start(&mut auditor).await);

    let producer = RedisProducer::new(redis.clone());
    for count in 0..20 {
        let ids = producer.produce(task(&queue, count)).await.expect("produce");
        assert_eq!(ids.len(), 2);
    }

    let sorted = |tasks: Vec<Task>| {
        let mut counts = tasks.into_iter().map(|task| task.count).collect::<Vec<_>>();
        counts.sort_unstable();
        counts
    };
    assert_eq!(sorted(receive(&mut workers_rx, 20).await), (0..20).collect::<Vec<_>>());
    assert_eq!(sorted(receive(&mut audit_rx, 20).await), (0..20).collect::<Vec<_>>());
    wait_for_counts(&Messages::new(redis.clone()), &queue, |counts| counts.acknowledged == 40).await;
    for consumer in running {
        consumer.stop().await;
    }

    assert!(workers_rx.try_recv().is_err(), "a group received a message twice");
}

#[tokio::test]
async fn cancelled_queues_finish_the_message_in_hand() {
    let redis = connect();
    let slow = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let fast = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let producer = RedisProducer::new(redis.clone());
    let messages = Messages::new(redis.clone());
    let in_hand = produce(&producer, task(&slow, 1)).await;

    let release = Arc::new(Notify::new());
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = consumer(&redis);
    let mut bus = consumer.events().subscribe();
    let gate = release.clone();
    consumer
        .consume(
            slow.clone(),
            None,
            service_fn(move |message: Message<Task>| {
                let gate = gate.clone();
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(message.id);
                    gate.notified().await;
                    Ok::<_, Infallible>(())
                }
            }),
        )
        .expect("consume");
    consumer.consume(fast.clone(), None, forward(tx)).expect("consume");
    let running = start(&mut consumer).await;

    assert_eq!(receive(&mut started_rx, 1).await, vec![in_hand.clone()]);
    assert!(consumer.cancel(&slow));
    assert!(!consumer.cancel(&slow));
    release.notify_one();
    let acked = events(&mut bus, 1, acknowledged).await;
    assert!(matches!(&acked[0], ConsumerEvent::MessageAcknowledged { id, .. } if *id == in_hand));

    for count in 0..3 {
        produce(&producer, task(&fast, count)).await;
    }
    let later = produce(&producer, task(&slow, 2)).await;
    assert_eq!(receive(&mut rx, 3).await.len(), 3);
    tokio::time::sleep(Duration::from_millis(600)).await;
    running.stop().await;

    assert!(started_rx.try_recv().is_err(), "a cancelled queue was still consumed");
    let counts = messages.count_by_status(&slow).await.expect("counts");
    assert_eq!((counts.pending, counts.processing, counts.acknowledged), (1, 0, 1));
    assert_eq!(messages.get(&later).await.expect("get").status(), MessageStatus::Pending);
}

#[tokio::test]
async fn consumers_given_up_on_too_early_register_again() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let messages = Messages::new(redis.clone());

    let mut consumer = consumer(&redis);
    let mut bus = consumer.events().subscribe();
    consumer
        .consume(
            queue.clone(),
            None,
            service_fn(|_: Message<Task>| futures::future::pending::<Result<(), Infallible>>()),
        )
        .expect("consume");
    let running = start(&mut consumer).await;
    let consumer_id = consumer.id().to_owned();
    let queue_consumers = format!("smq:q:{}:{}:consumers", queue.namespace, queue.name);

    // what a watchdog removes once it gives up on a consumer.
    let mut raw = raw_connection().await;
    redis::pipe()
        .atomic()
        .hdel("smq:consumers", &consumer_id)
        .ignore()
        .zrem("smq:heartbeats", &consumer_id)
        .ignore()
        .srem(&queue_consumers, &consumer_id)
        .ignore()
        .query_async::<_, ()>(&mut raw)
        .await
        .expect("unregister");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let registered: bool = raw.hexists("smq:consumers", &consumer_id).await.expect("registration");
    let listed: bool = raw.sismember(&queue_consumers, &consumer_id).await.expect("queue consumers");
    assert!(registered, "consumer info was not restored");
    assert!(listed, "queue consumer set was not restored");

    let producer = RedisProducer::new(redis.clone());
    let id = produce(&producer, task(&queue, 1).with_retry_delay(Duration::ZERO)).await;
    events(&mut bus, 1, |event| matches!(event, ConsumerEvent::MessageReceived { .. })).await;
    assert_eq!(messages.count_by_status(&queue).await.expect("counts").processing, 1);

    running.stop().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    impatient_workers().tick().await.expect("tick");

    let counts = messages.count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.pending, counts.processing), (1, 0));
    assert_eq!(
        messages.get(&id).await.expect("get").state.last_unack_cause,
        Some(UnackCause::OfflineConsumer)
    );
}

#[tokio::test]
async fn ephemeral_groups_take_their_delayed_messages_along() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PubSub).await;
    let messages = Messages::new(redis.clone());

    let mut consumer = consumer(&redis);
    let mut bus = consumer.events().subscribe();
    consumer
        .consume(
            queue.clone(),
            None,
            service_fn(|_: Message<Task>| futures::future::pending::<Result<(), Infallible>>()),
        )
        .expect("consume");
    let running = start(&mut consumer).await;

    let producer = RedisProducer::new(redis.clone());
    let id = produce(&producer, task(&queue, 1).with_retry_delay(Duration::from_secs(1))).await;
    events(&mut bus, 1, |event| matches!(event, ConsumerEvent::MessageReceived { .. })).await;
    running.stop().await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let workers = impatient_workers();
    workers.tick().await.expect("tick");
    assert!(ConsumerGroups::new(redis.clone())
        .list(&queue)
        .await
        .expect("groups")
        .is_empty());

    // past the retry delay, nothing is left to promote.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    workers.tick().await.expect("tick");
    let counts = messages.count_by_status(&queue).await.expect("counts");
    assert_eq!((counts.pending, counts.processing, counts.delayed), (0, 0, 0));
    assert!(matches!(messages.get(&id).await, Err(Error::MessageNotFound { .. })));
}

#[tokio::test]
async fn groups_keep_what_they_still_owe() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PubSub).await;
    let groups = ConsumerGroups::new(redis.clone());
    let producer = RedisProducer::new(redis.clone());
    let messages = Messages::new(redis.clone());
    groups.save(&queue, "billing").await.expect("save group");

    produce(
        &producer,
        task(&queue, 1)
            .with_retry_threshold(1)
            .with_retry_delay(Duration::from_secs(60)),
    )
    .await;
    let failing = || service_fn(|_: Message<Task>| async { Err::<(), _>(anyhow::anyhow!("rejected")) });
    let mut billing = consumer(&redis);
    let mut bus = billing.events().subscribe();
    billing.consume(queue.clone(), Some("billing"), failing()).expect("consume");
    let running = start(&mut billing).await;
    events(&mut bus, 1, |event| matches!(event, ConsumerEvent::MessageDelayed { .. })).await;
    running.stop().await;

    assert!(matches!(
        groups.delete(&queue, "billing").await,
        Err(Error::ConsumerGroupNotEmpty { .. })
    ));

    groups.save(&queue, "audit").await.expect("save group");
    let ids = producer
        .produce(task(&queue, 2).with_retry_threshold(0))
        .await
        .expect("produce");
    assert_eq!(ids.len(), 2);
    let mut audit = consumer(&redis);
    let mut bus = audit.events().subscribe();
    audit.consume(queue.clone(), Some("audit"), failing()).expect("consume");
    let running = start(&mut audit).await;
    let dead = events(&mut bus, 1, |event| matches!(event, ConsumerEvent::MessageDeadLettered { .. })).await;
    running.stop().await;
    let ConsumerEvent::MessageDeadLettered { id: dead_id, .. } = &dead[0] else {
        unreachable!()
    };

    groups.delete(&queue, "audit").await.expect("delete group");
    assert!(matches!(
        messages.requeue(&queue, dead_id).await,
        Err(Error::ConsumerGroupNotFound { group, .. }) if group == "audit"
    ));
}

#[tokio::test]
async fn messages_claimed_ahead_of_the_rate_limit_are_in_process() {
    let redis = connect();
    let queue = create_queue(&redis, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let messages = Messages::new(redis.clone());
    RateLimiter::new(redis.clone())
        .set(&queue, RateLimit::new(1, 3_600_000).expect("rate limit"))
        .await
        .expect("set rate limit");

    let producer = RedisProducer::new(redis.clone());
    produce(&producer, task(&queue, 1)).await;
    let waiting = produce(&producer, task(&queue, 2)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = consumer(&redis);
    consumer.consume(queue.clone(), None, forward(tx)).expect("consume");
    let running = start(&mut consumer).await;
    assert_eq!(receive(&mut rx, 1).await, vec![Task { count: 1 }]);
    // the second message is claimed, and waits for the next window.
    wait_for_counts(&messages, &queue, |counts| counts.acknowledged == 1 && counts.processing == 1).await;
    assert_eq!(messages.get(&waiting).await.expect("get").status(), MessageStatus::Pending);

    let report = messages.delete(&queue, &[waiting.clone()]).await.expect("delete");
    running.stop().await;

    assert_eq!(report.in_process, vec![waiting.clone()]);
    assert!(report.success.is_empty());
    assert!(messages.get(&waiting).await.is_ok());
}
