use serde::{Deserialize, Serialize};

/// The identity of a message.
///
/// Ids are time-ordered UUIDs, so sorting them lexicographically
/// approximates publish order; priority queues rely on this to break
/// ties between equal priorities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub(crate) String);

impl MessageId {
    /// Creates a fresh id.
    #[must_use]
    pub(crate) fn generate() -> Self { Self(uuid::Uuid::now_v7().to_string()) }

    /// Wraps an id read back from storage or supplied by an operator,
    /// e.g. to requeue or delete a message.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::ops::Deref for MessageId {
    type Target = str;

    fn deref(&self) -> &Self::Target { &self.0 }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.0.fmt(f) }
}

impl redis::ToRedisArgs for MessageId {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        redis::ToRedisArgs::write_redis_args(&&*self.0, out);
    }
}

impl redis::FromRedisValue for MessageId {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        String::from_redis_value(v).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let ids = (0..64)
            .map(|_| MessageId::generate())
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(ids.len(), 64);
    }
}
