//! valvelink Shared Protocol Types
//!
//! This crate provides the envelope types and datagram codec used between the
//! central scheduler and the field controllers, plus the timing parameters
//! both sides agree on.

pub mod codec;
pub mod proto;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use proto::*;

/// Magic tag opening a debug command line
pub const SOF_DEBUG: &[u8; 4] = b"DBGK";

/// Magic tag opening a universal/internal command line
pub const SOF_UNIVERSAL: &[u8; 4] = b"UCMD";

/// Get current timestamp in microseconds since Unix epoch
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Timing parameters for delivery tracking
pub mod timing {
    /// Sweeper tick in milliseconds
    pub const SWEEP_INTERVAL_MS: u64 = 1000;

    /// Time to wait for the required confirmations before retransmitting
    pub const RESPONSE_TIMEOUT_MS: u64 = 3000;

    /// Retransmissions allowed before a message expires.
    /// Bounded by the 2-bit retransmit counter of a packet record.
    pub const MAX_RETRANSMITS: u8 = 3;

    /// Silence after which a peer is declared unavailable (15.0 s)
    pub const MAX_DELAY_FOR_DISCONNECT_MS: u64 = 15_000;

    /// How long an unavailable peer is remembered before its record is dropped
    pub const PEER_RETENTION_MS: u64 = 300_000;

    /// Field controller heartbeat interval
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;
}

/// Bits of [`Header::required`]
pub mod confirm {
    pub const ACK: u32 = 1 << 0;
    pub const ACTION: u32 = 1 << 1;
    pub const RESPONSE: u32 = 1 << 2;
    pub const ALL: u32 = ACK | ACTION | RESPONSE;
}

/// Builder helpers for creating messages
impl Header {
    /// Create a new header stamped with the current time
    pub fn new(sender: impl Into<String>, kind: MessageKind, msg_id: u32, required: u32) -> Self {
        Self {
            msg_id,
            kind: kind.into(),
            required,
            send_time_us: now_us(),
            sender: sender.into(),
        }
    }
}

impl Envelope {
    /// Message kind from the header, `MsgUnknown` when absent or out of range
    pub fn kind(&self) -> MessageKind {
        self.header
            .as_ref()
            .and_then(|h| MessageKind::try_from(h.kind).ok())
            .unwrap_or(MessageKind::MsgUnknown)
    }

    /// Create a heartbeat envelope
    pub fn heartbeat(sender: impl Into<String>) -> Self {
        Self {
            header: Some(Header::new(sender, MessageKind::MsgHeartbeat, 0, 0)),
            payload: None,
        }
    }

    /// Create a valve control envelope expecting every confirmation
    pub fn valve_control(sender: impl Into<String>, msg_id: u32, valve_index: u32, open: bool) -> Self {
        Self {
            header: Some(Header::new(sender, MessageKind::MsgValveControl, msg_id, confirm::ALL)),
            payload: Some(envelope::Payload::ValveControl(ValveControl { valve_index, open })),
        }
    }

    /// Create a state request envelope expecting ack and response
    pub fn state_request(sender: impl Into<String>, msg_id: u32) -> Self {
        Self {
            header: Some(Header::new(
                sender,
                MessageKind::MsgStateRequest,
                msg_id,
                confirm::ACK | confirm::RESPONSE,
            )),
            payload: Some(envelope::Payload::StateRequest(StateRequest {})),
        }
    }

    /// Create a confirmation envelope (`MsgAck`, `MsgActionDone` or `MsgResponse`)
    pub fn confirmation(sender: impl Into<String>, kind: MessageKind, confirmation: Confirmation) -> Self {
        Self {
            header: Some(Header::new(sender, kind, 0, 0)),
            payload: Some(envelope::Payload::Confirmation(confirmation)),
        }
    }
}

impl Confirmation {
    /// Create a successful confirmation for a message
    pub fn ok(confirms: u32) -> Self {
        Self {
            confirms,
            success: true,
            message: String::new(),
            report: None,
        }
    }

    /// Create a failed confirmation for a message
    pub fn failed(confirms: u32, message: impl Into<String>) -> Self {
        Self {
            confirms,
            success: false,
            message: message.into(),
            report: None,
        }
    }
}
