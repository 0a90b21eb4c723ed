//! # **S**imple **M**essage **Q**ueue.
//!
//! A message queue backed by Redis.  Producers publish JSON messages
//! to queues, directly or through exchanges; consumers pull them off,
//! hand them to a [`tower::Service`], and acknowledge or
//! unacknowledge them depending on the outcome.
//!
//! On top of plain delivery, messages can be:
//!
//! 1. retried a bounded number of times, immediately or after a
//!    delay, and dead-lettered once the retries run out;
//! 2. scheduled, with a cron expression, an initial delay, or a
//!    number of repetitions;
//! 3. prioritized, on priority queues;
//! 4. expired, when they sit in a queue longer than their TTL.
//!
//! Queues are point-to-point (every message goes to one consumer) or
//! pub/sub (every consumer group gets its own copy), and can be
//! rate-limited, paused, stopped, or locked.
//!
//! ## Usage
//!
//! The library is split in two parts: the consumer, and the
//! producer.  The producer only has to serialize a message and write
//! it into every queue its destination resolves to; the consumer
//! pulls messages out of their queues, deserializes them, and tracks
//! what happened to them.
//!
//! Thus, the consumer is gated behind the `consumer` feature, and the
//! producer is gated behind the `producer` feature.  Both are on by
//! default.  Administration (queues, exchanges, consumer groups,
//! message browsing) and the background workers live in [`redis`]
//! and are always available.
//!
//! A consumer that is not told otherwise also runs the background
//! workers: the scheduler, the delayed-message promoter, and the
//! watchdog that recovers messages from consumers that went away.
//! Running them in several processes at once is safe.

pub mod config;
#[cfg(feature = "consumer")]
mod consumer;
mod error;
pub mod events;
pub mod exchange;
pub mod message;
#[cfg(feature = "producer")]
mod producer;
pub mod queue;
pub mod redis;

pub use self::config::Config;
#[cfg(feature = "consumer")]
pub use self::consumer::{Consumer, ConsumerBuilder, ConsumerProvider, ConsumerStream, Message, Spawn};
pub use self::error::{Error, Result};
pub use self::exchange::{ExchangeKind, ExchangeParams};
pub use self::message::{Destination, MessageId, MessagePriority, ProducibleMessage};
#[cfg(feature = "producer")]
pub use self::producer::ProducerProvider;
pub use self::queue::{DeliveryModel, QueueParams, QueueState, QueueType};
