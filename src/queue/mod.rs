mod operation;
mod rate_limit;

pub use self::operation::Operation;
pub use self::rate_limit::RateLimit;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a queue: a name scoped by a namespace.
///
/// Displayed (and parsed) as `name@namespace`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct QueueParams {
    pub namespace: String,
    pub name: String,
}

impl QueueParams {
    pub fn new(namespace: &str, name: &str) -> Result<Self> {
        Ok(Self {
            namespace: validate_name(namespace)?,
            name: validate_name(name)?,
        })
    }

    /// Parses `name@namespace`, falling back to `default_namespace`
    /// when the string carries no namespace.
    pub fn parse(value: &str, default_namespace: &str) -> Result<Self> {
        match value.split_once('@') {
            Some((name, namespace)) => Self::new(namespace, name),
            None => Self::new(default_namespace, value),
        }
    }
}

impl fmt::Display for QueueParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.namespace)
    }
}

impl From<QueueParams> for String {
    fn from(queue: QueueParams) -> Self { queue.to_string() }
}

impl TryFrom<String> for QueueParams {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let (name, namespace) = value.split_once('@').ok_or(Error::InvalidName {
            name: value.clone(),
            reason: "expected name@namespace",
        })?;
        Self::new(namespace, name)
    }
}

/// Normalizes and validates a queue, exchange, namespace, or
/// consumer group name.
///
/// Names are lowercased; they must start with a letter and contain
/// only ASCII alphanumerics, `-`, `_`, and `.`.
pub fn validate_name(name: &str) -> Result<String> {
    let lower = name.to_ascii_lowercase();
    let invalid = |reason| Error::InvalidName {
        name: name.to_owned(),
        reason,
    };

    if lower.is_empty() || lower.len() > 64 {
        return Err(invalid("must be between 1 and 64 characters"));
    }
    if !lower.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(invalid("must start with a letter"));
    }
    if !lower
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("may only contain alphanumerics, '-', '_' and '.'"));
    }

    Ok(lower)
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $repr:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $repr),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($repr => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} {other:?}", stringify!($name))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

string_enum! {
    /// The structure backing a queue's pending messages.
    QueueType {
        Lifo => "LIFO",
        Fifo => "FIFO",
        Priority => "PRIORITY",
    }
}

string_enum! {
    DeliveryModel {
        /// All consumers share a single pending structure.
        PointToPoint => "POINT_TO_POINT",
        /// Every consumer group gets its own copy of each message.
        PubSub => "PUB_SUB",
    }
}

string_enum! {
    /// The operational state of a queue, which decides the operations
    /// it accepts.  See [`Operation`].
    QueueState {
        Active => "ACTIVE",
        Paused => "PAUSED",
        Stopped => "STOPPED",
        Locked => "LOCKED",
    }
}

impl QueueState {
    pub const ALL: [Self; 4] = [Self::Active, Self::Paused, Self::Stopped, Self::Locked];
}

impl QueueType {
    #[must_use]
    pub const fn is_priority(self) -> bool { matches!(self, Self::Priority) }
}

/// One of the structures holding a queue's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSet {
    /// Waiting for delivery.  Pub/sub queues keep one pending
    /// structure per consumer group.
    Pending { group: Option<String> },
    Acknowledged,
    DeadLettered,
    Scheduled,
    /// Failed and waiting for their retry delay.
    Delayed,
}

/// The stored properties of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueProperties {
    pub queue_type: QueueType,
    pub delivery_model: DeliveryModel,
    pub state: QueueState,
    pub rate_limit: Option<RateLimit>,
    pub created_at: i64,
}

impl QueueProperties {
    /// Fails with [`Error::OperationNotPermitted`] when the current
    /// state forbids `operation`.
    pub fn check(&self, queue: &QueueParams, operation: Operation) -> Result<()> {
        if self.state.permits(operation) {
            Ok(())
        } else {
            Err(Error::OperationNotPermitted {
                queue: queue.clone(),
                operation,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_names() {
        let queue = QueueParams::parse("Orders@Billing", "default").expect("parse");
        assert_eq!(queue.name, "orders");
        assert_eq!(queue.namespace, "billing");
        assert_eq!(queue.to_string(), "orders@billing");

        let queue = QueueParams::parse("orders", "default").expect("parse");
        assert_eq!(queue.namespace, "default");
    }

    #[test]
    fn rejects_bad_names() {
        assert!(matches!(
            validate_name(""),
            Err(Error::InvalidName { .. })
        ));
        assert!(validate_name("1queue").is_err());
        assert!(validate_name("queue:with:colons").is_err());
        assert!(validate_name(&"q".repeat(65)).is_err());
        assert_eq!(validate_name("my-queue_1.a").expect("valid"), "my-queue_1.a");
    }

    #[test]
    fn enums_round_trip_through_strings() {
        for state in QueueState::ALL {
            assert_eq!(state.as_str().parse::<QueueState>(), Ok(state));
        }
        assert_eq!("PUB_SUB".parse(), Ok(DeliveryModel::PubSub));
        assert!("fifo".parse::<QueueType>().is_err());
    }
}
