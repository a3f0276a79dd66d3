//! The LXMF message lifecycle. States are monotonic except that `Failed`
//! may be re-entered after a retry; `Delivered` and `Propagated` are
//! terminal successes.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MessageState {
    Outbound,
    Sending,
    Sent,
    Delivered,
    Failed,
    Propagated,
    Received,
    Rejected,
    Cancelled,
}

impl MessageState {
    /// `Delivered` and `Propagated` never move to any other state.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Delivered | MessageState::Propagated)
    }

    /// Whether `next` is a legal transition from `self`. A terminal state
    /// only accepts itself; every other state may always move to `Failed`
    /// (retry) or `Cancelled` in addition to its forward progression.
    pub fn can_transition_to(self, next: MessageState) -> bool {
        if self.is_terminal() {
            return next == self;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_and_propagated_are_absorbing() {
        assert!(!MessageState::Delivered.can_transition_to(MessageState::Sending));
        assert!(!MessageState::Propagated.can_transition_to(MessageState::Failed));
        assert!(MessageState::Delivered.can_transition_to(MessageState::Delivered));
    }

    #[test]
    fn failed_may_be_retried() {
        assert!(MessageState::Failed.can_transition_to(MessageState::Sending));
        assert!(MessageState::Failed.can_transition_to(MessageState::Outbound));
    }

    #[test]
    fn non_terminal_states_accept_any_transition() {
        assert!(MessageState::Sending.can_transition_to(MessageState::Sent));
        assert!(MessageState::Sent.can_transition_to(MessageState::Cancelled));
    }
}
