//! # Redis Store
//!
//! Everything the queue keeps lives in Redis.  **This requires Redis
//! 6.2 or later**, for `BLMOVE` and `ZRANGE` options used below.
//!
//! ## Layout
//!
//! Every message is a hash (`smq:message:<id>`) holding its payload
//! and lifecycle fields, so a single field can be updated without
//! rewriting the message.  The structures of a queue only ever hold
//! message ids:
//!
//! - the pending structure: a list for FIFO and LIFO queues (pushed on
//!   opposite ends, always popped from the right), or a sorted set
//!   scored by priority.  Pub/sub queues have one per consumer group;
//! - one processing list per consumer, which a blocking `BLMOVE`
//!   moves ids into.  Whatever sits in there belongs to that consumer
//!   until it acknowledges or unacknowledges it;
//! - the acknowledged and dead-lettered sorted sets, scored by the
//!   time the message got there and bounded by the audit settings;
//! - the scheduled and delayed sets, which mirror the queue's entries
//!   of the global `smq:scheduled` and `smq:delayed` sorted sets the
//!   workers scan.
//!
//! ## Atomicity
//!
//! Every transition that touches more than one key is a Lua script
//! (see `scripts/`), and each script first checks that the message is
//! still where the caller believes it is.  That is what makes it safe
//! for a watchdog to recover messages from a consumer that is, in
//! fact, still alive: whichever of the two moves the message first
//! wins, and the other one becomes a no-op.
//!
//! Operations whose key set is not known in advance (deleting a
//! queue, binding an exchange) use `WATCH`/`MULTI` instead; see
//! `transaction.rs`.
//!
//! ## Connections
//!
//! Most operations borrow a pooled connection for their duration.
//! Each dequeue loop owns a dedicated connection, as a blocking pop
//! would otherwise stall everyone sharing it.  The poll timeout of
//! the consumer should stay well below the liveness threshold;
//! otherwise a consumer blocked on an empty queue is fine, but one
//! whose heartbeat cannot get through is recovered from.

#[cfg(feature = "consumer")]
mod consumer;
mod consumer_group;
mod data;
mod delivery;
mod exchange;
mod handle;
mod heartbeat;
mod keys;
mod messages;
#[cfg(feature = "producer")]
mod producer;
mod queue;
mod rate_limit;
mod scripts;
mod transaction;
mod workers;

#[cfg(feature = "consumer")]
pub use self::consumer::{RedisConsumer, RedisStream};
pub use self::consumer_group::ConsumerGroups;
pub use self::exchange::Exchanges;
pub use self::handle::RedisHandle;
pub use self::heartbeat::{ConsumerInfo, QueueRegistration};
pub use self::messages::{DeleteReport, Messages, Page, QueueCounts};
#[cfg(feature = "producer")]
pub use self::producer::RedisProducer;
pub use self::queue::QueueManager;
pub use self::rate_limit::RateLimiter;
pub use self::workers::Workers;

#[cfg(feature = "consumer")]
pub(crate) use self::{consumer_group::save_group, heartbeat::Heartbeat, queue::load_properties};

/// Milliseconds since the epoch; every stored timestamp uses this.
pub(crate) fn now() -> i64 { chrono::Utc::now().timestamp_millis() }
