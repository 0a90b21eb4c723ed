use super::Consumer;
use crate::config::ConsumerConfig;
use crate::events::{ConsumerEvent, EventBus, WorkerEvent};
use crate::redis::{RedisHandle, Workers};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builds a [`Consumer`].  Starts from the consumer section of the
/// handle's configuration.
pub struct ConsumerBuilder {
    pub(super) redis: RedisHandle,
    pub(super) config: ConsumerConfig,
    pub(super) events: EventBus<ConsumerEvent>,
    pub(super) worker_events: EventBus<WorkerEvent>,
    pub(super) workers: bool,
}

impl ConsumerBuilder {
    pub fn with_heartbeat_interval(self, heartbeat_interval: Duration) -> Self {
        let config = ConsumerConfig {
            heartbeat_interval,
            ..self.config
        };

        Self { config, ..self }
    }

    pub fn with_poll_timeout(self, poll_timeout: Duration) -> Self {
        let config = ConsumerConfig {
            poll_timeout,
            ..self.config
        };

        Self { config, ..self }
    }

    pub fn with_events(self, events: EventBus<ConsumerEvent>) -> Self { Self { events, ..self } }

    /// Whether the consumer also runs the background workers.  On by
    /// default; turn it off when the workers run elsewhere.
    pub fn with_workers(self, workers: bool) -> Self { Self { workers, ..self } }

    pub fn with_worker_events(self, worker_events: EventBus<WorkerEvent>) -> Self {
        Self {
            worker_events,
            ..self
        }
    }

    #[must_use]
    pub fn build(self) -> Consumer {
        let workers = self
            .workers
            .then(|| Workers::new(self.redis.clone()).with_events(self.worker_events));

        Consumer {
            consumer_id: uuid::Uuid::new_v4().to_string(),
            redis: self.redis,
            config: self.config,
            events: self.events,
            workers,
            handlers: Vec::new(),
            shutdown: CancellationToken::new(),
            queues: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for ConsumerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerBuilder")
            .field("redis", &self.redis)
            .field("config", &self.config)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}
