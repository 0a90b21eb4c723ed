//! Background workers.
//!
//! Three loops keep the queue moving independently of any consumer:
//! the scheduler fires scheduled messages, the delayed worker returns
//! messages whose retry delay elapsed, and the watchdog recovers the
//! messages of consumers that stopped beating.  Each runs on its own
//! interval; a failed tick is logged and retried on the next one.
//!
//! Every step they take is guarded inside a script, so any number of
//! processes may run workers against the same store at once.

mod delayed;
mod scheduler;
mod watchdog;

use self::delayed::DelayedWorker;
use self::scheduler::Scheduler;
use self::watchdog::Watchdog;
use super::RedisHandle;
use crate::error::Result;
use crate::events::{EventBus, WorkerEvent};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait::async_trait]
trait Worker: Send + Sync {
    const NAME: &'static str;

    async fn tick(&self) -> Result<()>;
}

/// The scheduler, delayed worker, and watchdog.
#[derive(Debug, Clone)]
pub struct Workers {
    redis: RedisHandle,
    events: EventBus<WorkerEvent>,
}

impl Workers {
    #[must_use]
    pub fn new(redis: RedisHandle) -> Self {
        Self {
            redis,
            events: EventBus::new(),
        }
    }

    #[must_use]
    pub fn with_events(self, events: EventBus<WorkerEvent>) -> Self { Self { events, ..self } }

    #[must_use]
    pub fn events(&self) -> &EventBus<WorkerEvent> { &self.events }

    fn scheduler(&self) -> Scheduler { Scheduler::new(self.redis.clone(), self.events.clone()) }

    fn delayed(&self) -> DelayedWorker { DelayedWorker::new(self.redis.clone(), self.events.clone()) }

    fn watchdog(&self) -> Watchdog { Watchdog::new(self.redis.clone(), self.events.clone()) }

    /// Runs every worker until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let config = self.redis.config().workers;
        tokio::join!(
            drive(self.scheduler(), config.scheduler_interval, &token, &self.events),
            drive(self.delayed(), config.delayed_interval, &token, &self.events),
            drive(self.watchdog(), config.watchdog_interval, &token, &self.events),
        );
        tracing::debug!("workers stopped");
    }

    /// Runs one tick of every worker, in order: the watchdog, the
    /// delayed worker, then the scheduler.
    pub async fn tick(&self) -> Result<()> {
        self.watchdog().tick().await?;
        self.delayed().tick().await?;
        self.scheduler().tick().await
    }
}

async fn drive<W: Worker>(
    worker: W,
    interval: Duration,
    token: &CancellationToken,
    events: &EventBus<WorkerEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(error) = worker.tick().await {
                    tracing::error!(worker = W::NAME, %error, "worker tick failed");
                    events.emit(WorkerEvent::Error {
                        worker: W::NAME,
                        error: error.to_string(),
                    });
                }
            }
        }
    }
}

/// `limit` as the count argument of a ranged sorted-set read.
fn batch(limit: usize) -> isize { isize::try_from(limit).unwrap_or(isize::MAX) }
