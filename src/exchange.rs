//! Exchanges route one publish to any number of queues.

use crate::error::{Error, Result};
use crate::queue::{string_enum, validate_name, QueueParams};
use serde::{Deserialize, Serialize};
use std::fmt;

string_enum! {
    ExchangeKind {
        /// Queues bound with a key equal to the routing key.
        Direct => "DIRECT",
        /// Queues bound with a pattern matching the routing key.
        Topic => "TOPIC",
        /// Every bound queue.
        FanOut => "FANOUT",
    }
}

/// Identifies an exchange, displayed as `name@namespace`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ExchangeParams {
    pub namespace: String,
    pub name: String,
}

impl ExchangeParams {
    pub fn new(namespace: &str, name: &str) -> Result<Self> {
        Ok(Self {
            namespace: validate_name(namespace)?,
            name: validate_name(name)?,
        })
    }

    pub fn parse(value: &str, default_namespace: &str) -> Result<Self> {
        match value.split_once('@') {
            Some((name, namespace)) => Self::new(namespace, name),
            None => Self::new(default_namespace, value),
        }
    }
}

impl fmt::Display for ExchangeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.namespace)
    }
}

impl From<ExchangeParams> for String {
    fn from(exchange: ExchangeParams) -> Self { exchange.to_string() }
}

impl TryFrom<String> for ExchangeParams {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let (name, namespace) = value.split_once('@').ok_or(Error::InvalidName {
            name: value.clone(),
            reason: "expected name@namespace",
        })?;
        Self::new(namespace, name)
    }
}

/// A queue bound to an exchange under a binding key.
///
/// Fan-out bindings have an empty key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binding {
    pub key: String,
    pub queue: QueueParams,
}

impl Binding {
    const SEPARATOR: char = '|';

    pub(crate) fn encode(&self) -> String { format!("{}{}{}", self.key, Self::SEPARATOR, self.queue) }

    pub(crate) fn decode(value: &str) -> Result<Self> {
        let (key, queue) = value.rsplit_once(Self::SEPARATOR).ok_or(Error::Decode {
            key: "exchange bindings".to_owned(),
            field: value.to_owned(),
            reason: "missing binding separator".to_owned(),
        })?;
        Ok(Self {
            key: key.to_owned(),
            queue: QueueParams::try_from(queue.to_owned())?,
        })
    }
}

impl ExchangeKind {
    /// Normalizes the key a queue is bound with.
    pub(crate) fn binding_key(self, exchange: &ExchangeParams, key: Option<&str>) -> Result<String> {
        match (self, key) {
            (Self::FanOut, _) => Ok(String::new()),
            (_, Some(key)) if !key.is_empty() => validate_routing_key(key, self == Self::Topic),
            _ => Err(Error::RoutingKeyRequired {
                exchange: exchange.to_string(),
            }),
        }
    }

    /// Whether a binding key selects a message published with
    /// `routing_key`.
    #[must_use]
    pub fn matches(self, binding_key: &str, routing_key: Option<&str>) -> bool {
        match (self, routing_key) {
            (Self::FanOut, _) => true,
            (Self::Direct, Some(routing_key)) => binding_key == routing_key,
            (Self::Topic, Some(routing_key)) => {
                let pattern = binding_key.split('.').collect::<Vec<_>>();
                let words = routing_key.split('.').collect::<Vec<_>>();
                topic_matches(&pattern, &words)
            }
            (_, None) => false,
        }
    }
}

fn validate_routing_key(key: &str, pattern: bool) -> Result<String> {
    let valid = key.split('.').all(|word| {
        (pattern && (word == "*" || word == "#"))
            || (!word.is_empty()
                && word
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
    });
    if valid {
        Ok(key.to_ascii_lowercase())
    } else {
        Err(Error::InvalidName {
            name: key.to_owned(),
            reason: "routing keys are '.'-separated words of alphanumerics, '-' and '_'",
        })
    }
}

/// AMQP-style topic matching: `*` matches exactly one word, `#`
/// matches zero or more.
fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.split_first(), words.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, words) || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some((&"*", rest)), Some((_, words))) => topic_matches(rest, words),
        (Some((expected, rest)), Some((word, words))) => {
            expected.eq_ignore_ascii_case(word) && topic_matches(rest, words)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> ExchangeParams { ExchangeParams::new("test", "events").expect("exchange") }

    #[test]
    fn topic_wildcards() {
        let kind = ExchangeKind::Topic;
        assert!(kind.matches("orders.*", Some("orders.created")));
        assert!(!kind.matches("orders.*", Some("orders.created.eu")));
        assert!(kind.matches("orders.#", Some("orders.created.eu")));
        assert!(kind.matches("orders.#", Some("orders")));
        assert!(kind.matches("#.eu", Some("orders.created.eu")));
        assert!(kind.matches("*.created.*", Some("orders.created.eu")));
        assert!(!kind.matches("payments.*", Some("orders.created")));
        assert!(!kind.matches("orders.*", None));
    }

    #[test]
    fn direct_matches_exactly() {
        assert!(ExchangeKind::Direct.matches("orders", Some("orders")));
        assert!(!ExchangeKind::Direct.matches("orders", Some("orders.created")));
        assert!(ExchangeKind::FanOut.matches("", None));
    }

    #[test]
    fn binding_keys() {
        let exchange = exchange();
        assert_eq!(
            ExchangeKind::FanOut
                .binding_key(&exchange, Some("ignored"))
                .expect("key"),
            ""
        );
        assert!(matches!(
            ExchangeKind::Direct.binding_key(&exchange, None),
            Err(Error::RoutingKeyRequired { .. })
        ));
        assert!(ExchangeKind::Direct.binding_key(&exchange, Some("a.*")).is_err());
        assert_eq!(
            ExchangeKind::Topic
                .binding_key(&exchange, Some("Orders.#"))
                .expect("key"),
            "orders.#"
        );
    }

    #[test]
    fn bindings_survive_encoding() {
        let binding = Binding {
            key: "orders.*".to_owned(),
            queue: QueueParams::new("test", "orders").expect("queue"),
        };
        assert_eq!(Binding::decode(&binding.encode()).expect("decode"), binding);
    }
}
