use super::MessageId;
use crate::queue::string_enum;
use std::fmt;

string_enum! {
    /// Where a message is in its lifecycle.  The status always agrees
    /// with the structure currently holding the message.
    MessageStatus {
        Pending => "PENDING",
        Processing => "PROCESSING",
        /// Failed and went straight back to the pending structure.
        UnackRequeuing => "UNACK_REQUEUING",
        /// Failed and is parked until its retry delay elapses.
        UnackDelaying => "UNACK_DELAYING",
        Acknowledged => "ACKNOWLEDGED",
        DeadLettered => "DEAD_LETTERED",
        Scheduled => "SCHEDULED",
    }
}

impl MessageStatus {
    /// Terminal statuses may be manually requeued.
    #[must_use]
    pub const fn is_terminal(self) -> bool { matches!(self, Self::Acknowledged | Self::DeadLettered) }
}

/// Why a message was not acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnackCause {
    HandlerError(String),
    Timeout,
    TtlExpired,
    OfflineConsumer,
    Unknown,
}

impl fmt::Display for UnackCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandlerError(error) => write!(f, "HANDLER_ERROR:{error}"),
            Self::Timeout => f.write_str("TIMEOUT"),
            Self::TtlExpired => f.write_str("TTL_EXPIRED"),
            Self::OfflineConsumer => f.write_str("OFFLINE_CONSUMER"),
            Self::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

impl std::str::FromStr for UnackCause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(error) = s.strip_prefix("HANDLER_ERROR:") {
            return Ok(Self::HandlerError(error.to_owned()));
        }
        match s {
            "TIMEOUT" => Ok(Self::Timeout),
            "TTL_EXPIRED" => Ok(Self::TtlExpired),
            "OFFLINE_CONSUMER" => Ok(Self::OfflineConsumer),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(format!("unknown unack cause {other:?}")),
        }
    }
}

/// What happens to a message that was not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unacknowledgement {
    /// Back into the pending structure right away.
    Requeue,
    /// Parked until `until` (milliseconds since the epoch).
    Delay { until: i64 },
    DeadLetter,
}

/// The mutable half of a message.
///
/// Timestamps are milliseconds since the epoch.  Every field maps to
/// one field of the stored message hash, so scripts can update a
/// single field without rewriting the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageState {
    pub id: MessageId,
    pub status: MessageStatus,
    pub attempts: u32,
    pub published_at: Option<i64>,
    pub scheduled_at: Option<i64>,
    pub last_scheduled_at: Option<i64>,
    pub processing_started_at: Option<i64>,
    pub acknowledged_at: Option<i64>,
    pub unacknowledged_at: Option<i64>,
    pub dead_lettered_at: Option<i64>,
    pub requeued_at: Option<i64>,
    pub requeue_count: u32,
    /// The message this one was created from, by a schedule firing
    /// or a manual requeue.
    pub parent_id: Option<MessageId>,
    /// Set on the original once it has been manually requeued.
    pub requeued_message_id: Option<MessageId>,
    pub consumer_id: Option<String>,
    pub last_unack_cause: Option<UnackCause>,
    pub expired: bool,
    pub schedule_delay_applied: bool,
    pub schedule_cron_fired: bool,
    pub schedule_repeat_count: u32,
}

impl MessageState {
    pub(crate) fn new(id: MessageId, status: MessageStatus) -> Self {
        Self {
            id,
            status,
            attempts: 0,
            published_at: None,
            scheduled_at: None,
            last_scheduled_at: None,
            processing_started_at: None,
            acknowledged_at: None,
            unacknowledged_at: None,
            dead_lettered_at: None,
            requeued_at: None,
            requeue_count: 0,
            parent_id: None,
            requeued_message_id: None,
            consumer_id: None,
            last_unack_cause: None,
            expired: false,
            schedule_delay_applied: false,
            schedule_cron_fired: false,
            schedule_repeat_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causes_round_trip() {
        for cause in [
            UnackCause::HandlerError("connection refused: db".to_owned()),
            UnackCause::Timeout,
            UnackCause::TtlExpired,
            UnackCause::OfflineConsumer,
            UnackCause::Unknown,
        ] {
            assert_eq!(cause.to_string().parse::<UnackCause>(), Ok(cause));
        }
    }

    #[test]
    fn only_acknowledged_and_dead_lettered_are_terminal() {
        assert!(MessageStatus::Acknowledged.is_terminal());
        assert!(MessageStatus::DeadLettered.is_terminal());
        assert!(!MessageStatus::UnackDelaying.is_terminal());
        assert!(!MessageStatus::Scheduled.is_terminal());
    }
}
