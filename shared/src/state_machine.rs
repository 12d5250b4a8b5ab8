//! Delivery State Machine
//!
//! Defines the lifecycle of an outbound envelope from creation to
//! confirmation or expiry, and the valid transitions between states.
//!
//! ```text
//! CREATED -> SENT -> AWAITING{missing}* -> CONFIRMED
//!              \          |
//!               +--> RETRYING{n} --> SENT ...
//!                         |
//!                         +--> EXPIRED
//! ```

use crate::confirm;

/// Lifecycle state of a delivery-tracked envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Built but not yet handed to the transport
    Created,
    /// Handed to the transport, nothing confirmed yet
    Sent,
    /// Partially confirmed; bits from [`confirm`] still missing
    Awaiting { missing: u32 },
    /// Timed out and queued for retransmission
    Retrying { attempt: u8 },
    /// Every required confirmation arrived (terminal)
    Confirmed,
    /// Retransmissions exhausted (terminal)
    Expired,
}

/// Everything the state depends on, as tracked by a packet record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryProgress {
    pub required: u32,
    pub received: u32,
    pub sent: bool,
    pub attempts: u8,
    pub errored: bool,
}

impl DeliveryState {
    /// Derive the state from the tracked progress bits
    pub fn from_progress(p: DeliveryProgress) -> Self {
        let missing = p.required & confirm::ALL & !p.received;

        if p.errored {
            DeliveryState::Expired
        } else if p.sent && missing == 0 {
            DeliveryState::Confirmed
        } else if !p.sent && p.attempts == 0 {
            DeliveryState::Created
        } else if !p.sent {
            DeliveryState::Retrying { attempt: p.attempts }
        } else if p.received & p.required == 0 {
            DeliveryState::Sent
        } else {
            DeliveryState::Awaiting { missing }
        }
    }

    /// True for Confirmed and Expired
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Confirmed | DeliveryState::Expired)
    }
}

/// Check if a transition from one state to another is valid
pub fn is_valid_transition(from: DeliveryState, to: DeliveryState) -> bool {
    use DeliveryState::*;

    match (from, to) {
        // Same state is always valid
        (a, b) if a == b => true,

        // Nothing leaves a terminal state
        (Confirmed | Expired, _) => false,

        (Created | Retrying { .. }, Sent) => true,
        (Sent, Awaiting { .. }) => true,
        (Awaiting { .. }, Awaiting { .. }) => true,
        (Sent | Awaiting { .. }, Confirmed) => true,

        // A retransmission may already carry earlier confirmations
        (Retrying { .. }, Awaiting { .. }) => true,

        // Timeouts loop back through Retrying
        (Created | Sent | Awaiting { .. }, Retrying { .. }) => true,
        (Retrying { .. }, Retrying { .. }) => true,
        (_, Expired) => true,

        _ => false,
    }
}
