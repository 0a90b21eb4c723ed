use serde::Deserialize;
use std::time::Duration;

/// Configuration shared by producers, consumers, and the background
/// workers.
///
/// Loading this from a file or the environment is left to the
/// application; everything here has a usable default, so
/// `Config::default()` connects to a local Redis.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The namespace used when a queue or exchange is named without
    /// one.
    pub namespace: String,
    pub redis_url: String,
    /// Maximum number of pooled (shared) connections.
    pub pool_size: u32,
    #[serde(with = "millis")]
    pub pool_idle_timeout: Duration,
    pub message_audit: MessageAuditConfig,
    pub consumer: ConsumerConfig,
    pub workers: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".to_owned(),
            redis_url: "redis://127.0.0.1/0".to_owned(),
            pool_size: 16,
            pool_idle_timeout: Duration::from_secs(60),
            message_audit: MessageAuditConfig::default(),
            consumer: ConsumerConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}

impl Config {
    pub fn with_namespace(self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..self
        }
    }

    pub fn with_redis_url(self, redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..self
        }
    }

    pub fn with_pool_size(self, pool_size: u32) -> Self { Self { pool_size, ..self } }

    pub fn with_message_audit(self, message_audit: MessageAuditConfig) -> Self {
        Self {
            message_audit,
            ..self
        }
    }

    pub fn with_consumer(self, consumer: ConsumerConfig) -> Self { Self { consumer, ..self } }

    pub fn with_workers(self, workers: WorkerConfig) -> Self { Self { workers, ..self } }
}

/// How the terminal audit structures are bounded.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct MessageAuditConfig {
    pub acknowledged: AuditStoreConfig,
    pub dead_lettered: AuditStoreConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AuditStoreConfig {
    /// When `false`, the message is deleted as soon as it reaches the
    /// terminal state.
    pub store: bool,
    /// Maximum number of records kept; `0` keeps everything.
    pub queue_size: u64,
    /// Maximum age of a record; zero keeps records forever.
    #[serde(with = "millis")]
    pub expire: Duration,
}

impl Default for AuditStoreConfig {
    fn default() -> Self {
        Self {
            store: true,
            queue_size: 10_000,
            expire: Duration::ZERO,
        }
    }
}

impl AuditStoreConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            store: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// A consumer whose heartbeat is older than this is considered
    /// offline, and its in-flight messages are recovered.
    #[serde(with = "millis")]
    pub liveness_threshold: Duration,
    /// How long a blocking dequeue waits before re-checking for
    /// cancellation and the queue state.
    #[serde(with = "millis")]
    pub poll_timeout: Duration,
    /// Priority queues cannot block; they are polled at this interval
    /// while empty.
    #[serde(with = "millis")]
    pub priority_poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            liveness_threshold: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(5),
            priority_poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    #[serde(with = "millis")]
    pub scheduler_interval: Duration,
    #[serde(with = "millis")]
    pub delayed_interval: Duration,
    #[serde(with = "millis")]
    pub watchdog_interval: Duration,
    /// Upper bound on the entries a single tick handles.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scheduler_interval: Duration::from_secs(1),
            delayed_interval: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(3),
            batch_size: 100,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"namespace": "billing", "consumer": {"poll_timeout": 250}}"#,
        )
        .expect("config");

        assert_eq!(config.namespace, "billing");
        assert_eq!(config.consumer.poll_timeout, Duration::from_millis(250));
        assert_eq!(
            config.consumer.liveness_threshold,
            ConsumerConfig::default().liveness_threshold
        );
        assert!(config.message_audit.dead_lettered.store);
    }
}
