//! Lua scripts for every transition that touches more than one
//! structure.  Each script is prefixed with the shared helpers in
//! `scripts/prelude.lua`.

use crate::error::{Error, Result};
use crate::queue::{Operation, QueueParams};
use redis::Script;

macro_rules! script {
    ($file:literal) => {
        Script::new(concat!(
            include_str!("scripts/prelude.lua"),
            include_str!(concat!("scripts/", $file))
        ))
    };
}

pub(crate) struct Scripts {
    pub(crate) save_queue: Script,
    pub(crate) publish: Script,
    pub(crate) schedule: Script,
    pub(crate) dequeue_priority: Script,
    pub(crate) fetch: Script,
    pub(crate) acknowledge: Script,
    pub(crate) unacknowledge: Script,
    pub(crate) promote_delayed: Script,
    pub(crate) fire_scheduled: Script,
    pub(crate) requeue: Script,
    pub(crate) count: Script,
    pub(crate) rate_limit: Script,
    pub(crate) delete_message: Script,
    pub(crate) purge: Script,
    pub(crate) delete_group: Script,
    pub(crate) heartbeat: Script,
    pub(crate) unregister: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Self {
            save_queue: script!("save_queue.lua"),
            publish: script!("publish.lua"),
            schedule: script!("schedule.lua"),
            dequeue_priority: script!("dequeue_priority.lua"),
            fetch: script!("fetch.lua"),
            acknowledge: script!("acknowledge.lua"),
            unacknowledge: script!("unacknowledge.lua"),
            promote_delayed: script!("promote_delayed.lua"),
            fire_scheduled: script!("fire_scheduled.lua"),
            requeue: script!("requeue.lua"),
            count: script!("count.lua"),
            rate_limit: script!("rate_limit.lua"),
            delete_message: script!("delete_message.lua"),
            purge: script!("purge.lua"),
            delete_group: script!("delete_group.lua"),
            heartbeat: script!("heartbeat.lua"),
            unregister: script!("unregister.lua"),
        }
    }
}

/// The reply of scripts that check the queue state first: a status
/// code, and the queue state (or type) the code refers to.
#[derive(Debug)]
pub(crate) struct Guarded {
    pub(crate) code: i64,
    pub(crate) detail: String,
}

impl Guarded {
    pub(crate) const OK: i64 = 1;
    pub(crate) const SKIPPED: i64 = 0;
    pub(crate) const QUEUE_NOT_FOUND: i64 = -1;
    pub(crate) const NOT_PERMITTED: i64 = -2;
    pub(crate) const TYPE_MISMATCH: i64 = -3;
    /// The detail names the missing consumer group.
    pub(crate) const GROUP_NOT_FOUND: i64 = -4;
}

impl Guarded {
    /// `true` when the script ran, `false` when it skipped its work
    /// because the message was no longer where the caller expected.
    pub(crate) fn check(self, script: &'static str, queue: &QueueParams, operation: Operation) -> Result<bool> {
        match self.code {
            Self::OK => Ok(true),
            Self::SKIPPED => Ok(false),
            Self::QUEUE_NOT_FOUND => Err(Error::QueueNotFound { queue: queue.clone() }),
            Self::NOT_PERMITTED => Err(Error::OperationNotPermitted {
                queue: queue.clone(),
                operation,
                state: decode_reply(script, &self.detail)?,
            }),
            code => Err(Error::ScriptReply {
                script,
                reply: format!("{code} {}", self.detail),
            }),
        }
    }
}

impl redis::FromRedisValue for Guarded {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let (code, detail): (i64, String) = redis::FromRedisValue::from_redis_value(v)?;
        Ok(Self { code, detail })
    }
}

/// Encodes alternating field names and values the way
/// `write_hash` in the prelude expects them.
pub(crate) fn encode_fields(fields: &[(&'static str, String)]) -> Result<String> {
    let flat = fields
        .iter()
        .flat_map(|(name, value)| [(*name).to_owned(), value.clone()])
        .collect::<Vec<_>>();
    Ok(serde_json::to_string(&flat)?)
}

/// Parses a string a script replied with.
pub(crate) fn decode_reply<T>(script: &'static str, value: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse().map_err(|reason| Error::ScriptReply {
        script,
        reply: format!("{value:?}: {reason}"),
    })
}

impl std::fmt::Debug for Scripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripts").finish_non_exhaustive()
    }
}
