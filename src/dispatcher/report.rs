//! Events the dispatcher emits for the application layer

use crate::store::service::ServiceFault;
use chrono::NaiveDateTime;
use std::fmt;

/// Why a packet was given up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryReason {
    /// No full confirmation after the last retransmission
    Timeout { retransmits: u8 },
    /// The controller answered with a failure
    Rejected { by: String, message: String },
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryReason::Timeout { retransmits } => {
                write!(f, "unconfirmed after {} retransmission(s)", retransmits)
            }
            ExpiryReason::Rejected { by, message } if message.is_empty() => {
                write!(f, "rejected by {}", by)
            }
            ExpiryReason::Rejected { by, message } => write!(f, "rejected by {}: {}", by, message),
        }
    }
}

/// Outcome notifications, one per notable delivery or liveness change
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryReport {
    /// The envelope left this host for the first time
    Sent {
        msg_id: u32,
        target: String,
        description: String,
    },
    /// Every required confirmation arrived. `valves` carries the state
    /// report when the final confirmation had one.
    Confirmed {
        msg_id: u32,
        target: String,
        description: String,
        valves: Option<Vec<bool>>,
    },
    Expired {
        msg_id: u32,
        target: String,
        description: String,
        reason: ExpiryReason,
    },
    /// A one-shot schedule passed without firing
    ScheduleMissed { command: String, at: NaiveDateTime },
    ServiceUp { peer: String },
    ServiceDown { peer: String, reason: ServiceFault },
    TimeSynced { at: NaiveDateTime },
}
