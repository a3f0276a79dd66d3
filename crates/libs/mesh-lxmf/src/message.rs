//! The application-facing message type: a [`crate::wire::WireMessage`] plus
//! the state-machine bookkeeping the router and store operate on.

use crate::state::MessageState;
use crate::wire::WireMessage;

#[derive(Debug, Clone)]
pub struct Message {
    pub wire: WireMessage,
    pub timestamp: f64,
    pub state: MessageState,
    pub incoming: bool,
}

impl Message {
    pub fn new_outbound(destination: [u8; 16], source: [u8; 16], payload: crate::payload::Payload) -> Self {
        let timestamp = payload.timestamp;
        Self {
            wire: WireMessage::new(destination, source, payload),
            timestamp,
            state: MessageState::Outbound,
            incoming: false,
        }
    }

    pub fn from_inbound(wire: WireMessage) -> Self {
        let timestamp = wire.payload.timestamp;
        Self { wire, timestamp, state: MessageState::Received, incoming: true }
    }

    pub fn hash(&self) -> [u8; 32] {
        self.wire.hash()
    }

    pub fn destination(&self) -> [u8; 16] {
        self.wire.destination
    }

    pub fn source(&self) -> [u8; 16] {
        self.wire.source
    }

    /// Applies a state transition, returning whether it was accepted. A
    /// rejected transition (attempting to leave a terminal state for
    /// anything but itself) leaves `state` unchanged.
    pub fn set_state(&mut self, next: MessageState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}
