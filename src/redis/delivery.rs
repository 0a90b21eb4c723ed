//! The two ways a delivered message leaves a consumer's processing
//! list.  Consumers call these for the messages they handled; the
//! watchdog calls [`unacknowledge`] for the messages of consumers
//! that went offline.

use super::keys::{self, global, QueueKeys};
use super::RedisHandle;
use crate::config::AuditStoreConfig;
use crate::error::{Error, Result};
use crate::message::{MessageEnvelope, UnackCause, Unacknowledgement};
use redis::aio::MultiplexedConnection;

/// Moves a message from `consumer_id`'s processing list to the
/// acknowledged set.  Returns `false` when the consumer no longer
/// held it.
pub(crate) async fn acknowledge(
    redis: &RedisHandle,
    conn: &mut MultiplexedConnection,
    envelope: &MessageEnvelope,
    consumer_id: &str,
) -> Result<bool> {
    let keys = QueueKeys::new(&envelope.queue);
    let (store, size, expire) = audit_args(&redis.config().message_audit.acknowledged);

    let acknowledged: i64 = redis
        .scripts()
        .acknowledge
        .key(keys.processing(consumer_id))
        .key(keys::message(envelope.id()))
        .key(keys.acknowledged())
        .key(keys.messages())
        .arg(envelope.id())
        .arg(super::now())
        .arg(store)
        .arg(size)
        .arg(expire)
        .arg(global::MESSAGE_PREFIX)
        .invoke_async(conn)
        .await?;

    if acknowledged == 1 {
        tracing::debug!(message_id = %envelope.id(), queue = %envelope.queue, consumer_id, "message acknowledged");
    }
    Ok(acknowledged == 1)
}

/// Moves a message out of `consumer_id`'s processing list into the
/// retry path, or into the dead-letter set once its retries are
/// exhausted.
///
/// Returns `None` when the consumer no longer held the message (it
/// was acknowledged, or recovered by a watchdog, concurrently).
pub(crate) async fn unacknowledge(
    redis: &RedisHandle,
    conn: &mut MultiplexedConnection,
    envelope: &MessageEnvelope,
    consumer_id: &str,
    cause: &UnackCause,
) -> Result<Option<Unacknowledgement>> {
    let now = super::now();
    let decision = envelope.unacknowledgement(cause, now);
    let (action, due) = match decision {
        Unacknowledgement::Requeue => ("requeue", 0),
        Unacknowledgement::Delay { until } => ("delay", until),
        Unacknowledgement::DeadLetter => ("dead-letter", 0),
    };
    let keys = QueueKeys::new(&envelope.queue);
    let (store, size, expire) = audit_args(&redis.config().message_audit.dead_lettered);
    let expired = matches!(cause, UnackCause::TtlExpired);

    let outcome: i64 = redis
        .scripts()
        .unacknowledge
        .key(keys.processing(consumer_id))
        .key(keys::message(envelope.id()))
        .key(keys.pending(envelope.consumer_group.as_deref()))
        .key(keys.dead_lettered())
        .key(keys.messages())
        .key(global::DELAYED)
        .key(keys.delayed())
        .key(keys.properties())
        .arg(envelope.id())
        .arg(now)
        .arg(action)
        .arg(cause.to_string())
        .arg(due)
        .arg(envelope.priority_score())
        .arg(store)
        .arg(size)
        .arg(expire)
        .arg(global::MESSAGE_PREFIX)
        .arg(if expired { "1" } else { "0" })
        .invoke_async(conn)
        .await?;

    let decision = match outcome {
        0 => return Ok(None),
        1 => Unacknowledgement::Requeue,
        2 => decision,
        // also when the queue vanished before a requeue.
        3 => Unacknowledgement::DeadLetter,
        other => {
            return Err(Error::ScriptReply {
                script: "unacknowledge",
                reply: other.to_string(),
            })
        }
    };

    if decision == Unacknowledgement::DeadLetter {
        tracing::info!(message_id = %envelope.id(), queue = %envelope.queue, %cause, "message dead-lettered");
    } else {
        tracing::debug!(message_id = %envelope.id(), queue = %envelope.queue, %cause, ?decision, "message unacknowledged");
    }
    Ok(Some(decision))
}

/// The arguments the audit helper of the scripts expects.
fn audit_args(config: &AuditStoreConfig) -> (&'static str, u64, u64) {
    let expire = u64::try_from(config.expire.as_millis()).unwrap_or(u64::MAX);
    (if config.store { "1" } else { "0" }, config.queue_size, expire)
}
