use super::QueueState;
use std::fmt;

/// A mutating operation, checked against the queue's state before it
/// touches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Operation {
    Produce,
    Consume,
    Purge,
    Delete,
    RateLimit,
    ConsumerGroups,
    ManageMessages,
    SetState,
}

impl Operation {
    const fn bit(self) -> u16 { 1 << self as u16 }
}

const ALL: u16 = Operation::Produce.bit()
    | Operation::Consume.bit()
    | Operation::Purge.bit()
    | Operation::Delete.bit()
    | Operation::RateLimit.bit()
    | Operation::ConsumerGroups.bit()
    | Operation::ManageMessages.bit()
    | Operation::SetState.bit();

impl QueueState {
    const fn permitted(self) -> u16 {
        match self {
            Self::Active => ALL,
            Self::Paused => ALL & !Operation::Consume.bit(),
            Self::Stopped => ALL & !(Operation::Consume.bit() | Operation::Produce.bit()),
            Self::Locked => Operation::SetState.bit(),
        }
    }

    #[must_use]
    pub const fn permits(self, operation: Operation) -> bool {
        self.permitted() & operation.bit() != 0
    }

    /// The states permitting `operation`, comma separated; scripts
    /// receive this to check the state atomically.
    pub(crate) fn permitting(operation: Operation) -> String {
        Self::ALL
            .iter()
            .filter(|state| state.permits(operation))
            .map(|state| state.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Produce => "produce",
            Self::Consume => "consume",
            Self::Purge => "purge",
            Self::Delete => "delete",
            Self::RateLimit => "rate limit",
            Self::ConsumerGroups => "consumer group management",
            Self::ManageMessages => "message management",
            Self::SetState => "state change",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_permits_everything() {
        for op in [
            Operation::Produce,
            Operation::Consume,
            Operation::Purge,
            Operation::Delete,
            Operation::RateLimit,
            Operation::ConsumerGroups,
            Operation::ManageMessages,
            Operation::SetState,
        ] {
            assert!(QueueState::Active.permits(op), "{op}");
        }
    }

    #[test]
    fn paused_and_stopped_block_delivery() {
        assert!(!QueueState::Paused.permits(Operation::Consume));
        assert!(QueueState::Paused.permits(Operation::Produce));
        assert!(!QueueState::Stopped.permits(Operation::Produce));
        assert!(QueueState::Stopped.permits(Operation::Purge));
    }

    #[test]
    fn locked_only_permits_state_changes() {
        assert!(QueueState::Locked.permits(Operation::SetState));
        assert!(!QueueState::Locked.permits(Operation::Delete));
        assert!(!QueueState::Locked.permits(Operation::Produce));
    }

    #[test]
    fn lists_permitting_states() {
        assert_eq!(QueueState::permitting(Operation::Produce), "ACTIVE,PAUSED");
        assert_eq!(QueueState::permitting(Operation::Consume), "ACTIVE");
        assert_eq!(
            QueueState::permitting(Operation::SetState),
            "ACTIVE,PAUSED,STOPPED,LOCKED"
        );
    }
}
