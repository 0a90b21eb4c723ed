//! Mapping between domain types and the hashes they are stored in.
//!
//! Every stored field has a tag below; decoding a hash with a field
//! we do not know is a schema mismatch, and fails with
//! [`Error::Decode`] rather than silently dropping data.

use crate::error::{Error, Result};
use crate::message::{MessageEnvelope, MessageId, MessageState, MessageStatus, ProducibleMessage};
use crate::queue::{string_enum, QueueParams, QueueProperties};
use std::collections::HashMap;
use std::str::FromStr;

string_enum! {
    MessageField {
        Payload => "payload",
        Queue => "queue",
        ConsumerGroup => "consumer_group",
        Id => "id",
        Status => "status",
        Attempts => "attempts",
        PublishedAt => "published_at",
        ScheduledAt => "scheduled_at",
        LastScheduledAt => "last_scheduled_at",
        ProcessingStartedAt => "processing_started_at",
        AcknowledgedAt => "acknowledged_at",
        UnacknowledgedAt => "unacknowledged_at",
        DeadLetteredAt => "dead_lettered_at",
        RequeuedAt => "requeued_at",
        RequeueCount => "requeue_count",
        ParentId => "parent_id",
        RequeuedMessageId => "requeued_message_id",
        ConsumerId => "consumer_id",
        LastUnackCause => "last_unack_cause",
        Expired => "expired",
        ScheduleDelayApplied => "schedule_delay_applied",
        ScheduleCronFired => "schedule_cron_fired",
        ScheduleRepeatCount => "schedule_repeat_count",
    }
}

string_enum! {
    QueueField {
        Type => "type",
        DeliveryModel => "delivery_model",
        State => "state",
        RateLimit => "rate_limit",
        CreatedAt => "created_at",
    }
}

type Fields = Vec<(&'static str, String)>;

struct Decoder<'a> {
    key: &'a str,
}

impl Decoder<'_> {
    fn error(&self, field: &str, reason: impl Into<String>) -> Error {
        Error::Decode {
            key: self.key.to_owned(),
            field: field.to_owned(),
            reason: reason.into(),
        }
    }

    fn parse<T>(&self, field: &str, value: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        value
            .parse()
            .map_err(|error: T::Err| self.error(field, error.to_string()))
    }

    fn flag(&self, field: &str, value: &str) -> Result<bool> {
        match value {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(self.error(field, format!("expected a boolean, got {other:?}"))),
        }
    }

    fn required<T>(&self, field: &str, value: Option<T>) -> Result<T> {
        value.ok_or_else(|| self.error(field, "missing"))
    }
}

impl MessageEnvelope {
    /// The hash fields this envelope is stored as.
    pub(crate) fn to_fields(&self) -> Result<Fields> {
        let state = &self.state;
        let mut fields = vec![
            (MessageField::Payload.as_str(), serde_json::to_string(&self.message)?),
            (MessageField::Queue.as_str(), self.queue.to_string()),
            (MessageField::Id.as_str(), state.id.to_string()),
            (MessageField::Status.as_str(), state.status.to_string()),
            (MessageField::Attempts.as_str(), state.attempts.to_string()),
            (MessageField::RequeueCount.as_str(), state.requeue_count.to_string()),
            (MessageField::Expired.as_str(), state.expired.to_string()),
            (
                MessageField::ScheduleDelayApplied.as_str(),
                state.schedule_delay_applied.to_string(),
            ),
            (
                MessageField::ScheduleCronFired.as_str(),
                state.schedule_cron_fired.to_string(),
            ),
            (
                MessageField::ScheduleRepeatCount.as_str(),
                state.schedule_repeat_count.to_string(),
            ),
        ];

        let optional = [
            (MessageField::ConsumerGroup, self.consumer_group.clone()),
            (MessageField::PublishedAt, state.published_at.map(|v| v.to_string())),
            (MessageField::ScheduledAt, state.scheduled_at.map(|v| v.to_string())),
            (
                MessageField::LastScheduledAt,
                state.last_scheduled_at.map(|v| v.to_string()),
            ),
            (
                MessageField::ProcessingStartedAt,
                state.processing_started_at.map(|v| v.to_string()),
            ),
            (MessageField::AcknowledgedAt, state.acknowledged_at.map(|v| v.to_string())),
            (
                MessageField::UnacknowledgedAt,
                state.unacknowledged_at.map(|v| v.to_string()),
            ),
            (MessageField::DeadLetteredAt, state.dead_lettered_at.map(|v| v.to_string())),
            (MessageField::RequeuedAt, state.requeued_at.map(|v| v.to_string())),
            (MessageField::ParentId, state.parent_id.as_ref().map(ToString::to_string)),
            (
                MessageField::RequeuedMessageId,
                state.requeued_message_id.as_ref().map(ToString::to_string),
            ),
            (MessageField::ConsumerId, state.consumer_id.clone()),
            (
                MessageField::LastUnackCause,
                state.last_unack_cause.as_ref().map(ToString::to_string),
            ),
        ];
        fields.extend(
            optional
                .into_iter()
                .filter_map(|(field, value)| value.map(|value| (field.as_str(), value))),
        );

        Ok(fields)
    }

    /// Rebuilds an envelope from the hash stored at `key`.
    pub(crate) fn from_fields(key: &str, raw: &HashMap<String, String>) -> Result<Self> {
        let decoder = Decoder { key };
        let mut message: Option<ProducibleMessage> = None;
        let mut queue: Option<QueueParams> = None;
        let mut consumer_group = None;
        let mut id = None;
        let mut status = None;
        let mut state = MessageState::new(MessageId::new(""), MessageStatus::Pending);

        for (name, value) in raw {
            let field = decoder.parse::<MessageField>(name, name)?;
            let time = || decoder.parse::<i64>(name, value).map(Some);

            match field {
                MessageField::Payload => {
                    message = Some(
                        serde_json::from_str(value)
                            .map_err(|error| decoder.error(name, error.to_string()))?,
                    );
                }
                MessageField::Queue => {
                    queue = Some(
                        QueueParams::try_from(value.clone())
                            .map_err(|error| decoder.error(name, error.to_string()))?,
                    );
                }
                MessageField::ConsumerGroup => consumer_group = Some(value.clone()),
                MessageField::Id => id = Some(MessageId::new(value.clone())),
                MessageField::Status => status = Some(decoder.parse::<MessageStatus>(name, value)?),
                MessageField::Attempts => state.attempts = decoder.parse(name, value)?,
                MessageField::PublishedAt => state.published_at = time()?,
                MessageField::ScheduledAt => state.scheduled_at = time()?,
                MessageField::LastScheduledAt => state.last_scheduled_at = time()?,
                MessageField::ProcessingStartedAt => state.processing_started_at = time()?,
                MessageField::AcknowledgedAt => state.acknowledged_at = time()?,
                MessageField::UnacknowledgedAt => state.unacknowledged_at = time()?,
                MessageField::DeadLetteredAt => state.dead_lettered_at = time()?,
                MessageField::RequeuedAt => state.requeued_at = time()?,
                MessageField::RequeueCount => state.requeue_count = decoder.parse(name, value)?,
                MessageField::ParentId => state.parent_id = Some(MessageId::new(value.clone())),
                MessageField::RequeuedMessageId => {
                    state.requeued_message_id = Some(MessageId::new(value.clone()));
                }
                MessageField::ConsumerId => state.consumer_id = Some(value.clone()),
                MessageField::LastUnackCause => {
                    state.last_unack_cause = Some(decoder.parse(name, value)?);
                }
                MessageField::Expired => state.expired = decoder.flag(name, value)?,
                MessageField::ScheduleDelayApplied => {
                    state.schedule_delay_applied = decoder.flag(name, value)?;
                }
                MessageField::ScheduleCronFired => {
                    state.schedule_cron_fired = decoder.flag(name, value)?;
                }
                MessageField::ScheduleRepeatCount => {
                    state.schedule_repeat_count = decoder.parse(name, value)?;
                }
            }
        }

        state.id = decoder.required(MessageField::Id.as_str(), id)?;
        state.status = decoder.required(MessageField::Status.as_str(), status)?;

        Ok(Self {
            message: decoder.required(MessageField::Payload.as_str(), message)?,
            queue: decoder.required(MessageField::Queue.as_str(), queue)?,
            consumer_group,
            state,
        })
    }
}

impl QueueProperties {
    pub(crate) fn to_fields(&self) -> Result<Fields> {
        let mut fields = vec![
            (QueueField::Type.as_str(), self.queue_type.to_string()),
            (QueueField::DeliveryModel.as_str(), self.delivery_model.to_string()),
            (QueueField::State.as_str(), self.state.to_string()),
            (QueueField::CreatedAt.as_str(), self.created_at.to_string()),
        ];
        if let Some(rate_limit) = &self.rate_limit {
            fields.push((QueueField::RateLimit.as_str(), serde_json::to_string(rate_limit)?));
        }
        Ok(fields)
    }

    pub(crate) fn from_fields(key: &str, raw: &HashMap<String, String>) -> Result<Self> {
        let decoder = Decoder { key };
        let mut queue_type = None;
        let mut delivery_model = None;
        let mut state = None;
        let mut rate_limit = None;
        let mut created_at = 0;

        for (name, value) in raw {
            match decoder.parse::<QueueField>(name, name)? {
                QueueField::Type => queue_type = Some(decoder.parse(name, value)?),
                QueueField::DeliveryModel => delivery_model = Some(decoder.parse(name, value)?),
                QueueField::State => state = Some(decoder.parse(name, value)?),
                QueueField::RateLimit => {
                    rate_limit = Some(
                        serde_json::from_str(value)
                            .map_err(|error| decoder.error(name, error.to_string()))?,
                    );
                }
                QueueField::CreatedAt => created_at = decoder.parse(name, value)?,
            }
        }

        Ok(Self {
            queue_type: decoder.required(QueueField::Type.as_str(), queue_type)?,
            delivery_model: decoder.required(QueueField::DeliveryModel.as_str(), delivery_model)?,
            state: decoder.required(QueueField::State.as_str(), state)?,
            rate_limit,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UnackCause;
    use crate::queue::{DeliveryModel, QueueState, QueueType, RateLimit};

    fn raw(fields: Fields) -> HashMap<String, String> {
        fields
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect()
    }

    #[test]
    fn envelopes_survive_storage() {
        let queue = QueueParams::new("test", "orders").expect("queue");
        let message = ProducibleMessage::new(&serde_json::json!({ "order": 7 }))
            .expect("message")
            .to_queue(queue.clone());
        let mut envelope = MessageEnvelope::new(message, queue, Some("g1".to_owned()), MessageStatus::Pending);
        envelope.state.published_at = Some(1_000);
        envelope.state.last_unack_cause = Some(UnackCause::HandlerError("boom".to_owned()));
        envelope.state.attempts = 2;

        let fields = envelope.to_fields().expect("encode");
        let decoded = MessageEnvelope::from_fields("smq:message:x", &raw(fields)).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut fields = raw(vec![("id", "a".to_owned()), ("status", "PENDING".to_owned())]);
        fields.insert("colour".to_owned(), "blue".to_owned());

        let error = MessageEnvelope::from_fields("smq:message:a", &fields).expect_err("decode");
        assert!(matches!(error, Error::Decode { field, .. } if field == "colour"));
    }

    #[test]
    fn missing_payload_is_rejected() {
        let fields = raw(vec![("id", "a".to_owned()), ("status", "PENDING".to_owned())]);
        let error = MessageEnvelope::from_fields("smq:message:a", &fields).expect_err("decode");
        assert!(matches!(error, Error::Decode { field, .. } if field == "payload"));
    }

    #[test]
    fn queue_properties_survive_storage() {
        let properties = QueueProperties {
            queue_type: QueueType::Priority,
            delivery_model: DeliveryModel::PubSub,
            state: QueueState::Paused,
            rate_limit: Some(RateLimit::new(5, 1_000).expect("rate limit")),
            created_at: 42,
        };
        let fields = properties.to_fields().expect("encode");
        assert_eq!(
            QueueProperties::from_fields("props", &raw(fields)).expect("decode"),
            properties
        );
    }
}
