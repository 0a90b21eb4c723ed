use super::keys::{global, QueueKeys};
use super::RedisHandle;
use crate::error::Result;
use crate::queue::QueueParams;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One queue a consumer consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRegistration {
    pub queue: QueueParams,
    pub group: Option<String>,
    /// The group was created for this consumer alone, and goes away
    /// with it.
    #[serde(default)]
    pub ephemeral: bool,
}

/// What a consumer records about itself while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub queues: Vec<QueueRegistration>,
    pub pid: u32,
    pub started_at: i64,
}

/// Registers a consumer and keeps its heartbeat fresh.
///
/// The heartbeat is the only liveness signal: once it is older than
/// the liveness threshold, the watchdog treats the consumer as dead
/// and recovers everything it holds.  A consumer the watchdog gave up
/// on too early (after a network partition, say) re-registers on its
/// next beat.
#[derive(Debug, Clone)]
pub(crate) struct Heartbeat {
    redis: RedisHandle,
    consumer_id: String,
    queues: Vec<QueueRegistration>,
    /// The serialized [`ConsumerInfo`].
    info: String,
}

impl Heartbeat {
    #[tracing::instrument(skip(redis, queues))]
    pub(crate) async fn register(
        redis: RedisHandle,
        consumer_id: String,
        queues: Vec<QueueRegistration>,
    ) -> Result<Self> {
        let info = ConsumerInfo {
            queues,
            pid: std::process::id(),
            started_at: super::now(),
        };
        let heartbeat = Self {
            redis,
            consumer_id,
            info: serde_json::to_string(&info)?,
            queues: info.queues,
        };

        let mut conn = heartbeat.redis.shared().await?;
        heartbeat.write(&mut conn, true).await?;
        tracing::debug!(queues = heartbeat.queues.len(), "consumer registered");
        drop(conn);
        Ok(heartbeat)
    }

    /// Writes the heartbeat; `overwrite` replaces the stored info
    /// instead of only restoring it.  Returns whether any part of the
    /// registration had to be restored.
    async fn write(&self, conn: &mut MultiplexedConnection, overwrite: bool) -> Result<bool> {
        let script = &self.redis.scripts().heartbeat;
        let mut invocation = script.key(global::HEARTBEATS);
        invocation
            .key(global::CONSUMERS)
            .arg(&self.consumer_id)
            .arg(super::now())
            .arg(&self.info)
            .arg(if overwrite { "1" } else { "0" });
        for registration in &self.queues {
            let keys = QueueKeys::new(&registration.queue);
            let ephemeral = match (registration.ephemeral, &registration.group) {
                (true, Some(group)) => group.as_str(),
                _ => "",
            };
            invocation
                .key(keys.consumers())
                .key(keys.properties())
                .key(keys.groups())
                .key(keys.ephemeral_groups())
                .arg(ephemeral);
        }

        let restored: i64 = invocation.invoke_async(conn).await?;
        Ok(restored == 1)
    }

    pub(crate) async fn beat(&self) -> Result<()> {
        let mut conn = self.redis.shared().await?;
        if self.write(&mut conn, false).await? {
            tracing::warn!(consumer_id = %self.consumer_id, "registration restored; the watchdog had given up on this consumer");
        }
        Ok(())
    }

    /// Beats every `interval` until `token` is cancelled.  A failed
    /// beat is logged and retried on the next tick; the watchdog only
    /// acts once beats have been missing for the whole threshold.
    pub(crate) async fn run(self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.beat().await {
                        tracing::error!(consumer_id = %self.consumer_id, %error, "heartbeat failed");
                    }
                }
            }
        }

        tracing::debug!(consumer_id = %self.consumer_id, "heartbeat stopped");
    }
}

/// Reads a consumer's registration; `None` when it never registered
/// or has already been removed.
pub(crate) async fn load_info(conn: &mut MultiplexedConnection, consumer_id: &str) -> Result<Option<ConsumerInfo>> {
    let raw: Option<String> = conn.hget(global::CONSUMERS, consumer_id).await?;
    Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
}

/// Removes a consumer's registration, unless it turns out to be
/// alive after all: beating again since `cutoff`, or holding messages.
/// Returns whether it was removed.
pub(crate) async fn unregister(
    redis: &RedisHandle,
    conn: &mut MultiplexedConnection,
    consumer_id: &str,
    info: Option<&ConsumerInfo>,
    cutoff: i64,
) -> Result<bool> {
    let script = &redis.scripts().unregister;
    let mut invocation = script.key(global::CONSUMERS);
    invocation.key(global::HEARTBEATS).arg(consumer_id).arg(cutoff);
    for registration in info.map(|info| info.queues.as_slice()).unwrap_or_default() {
        let keys = QueueKeys::new(&registration.queue);
        invocation
            .key(keys.consumers())
            .key(keys.processing(consumer_id));
    }

    let removed: i64 = invocation.invoke_async(conn).await?;
    Ok(removed == 1)
}
