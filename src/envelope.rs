//! Delivery-tracked outbound units

use bytes::Bytes;
use chrono::{DateTime, Utc};
use valvelink_shared::state_machine::DeliveryState;

/// One outbound protocol message as seen by delivery tracking
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    /// Random, non-zero, unique among in-flight envelopes
    pub msg_id: u32,
    /// Required confirmations, a `confirm` mask
    pub required: u32,
    pub send_time: DateTime<Utc>,
    pub state: DeliveryState,
}

impl CommandEnvelope {
    pub fn new(msg_id: u32, required: u32) -> Self {
        Self {
            msg_id,
            required,
            send_time: Utc::now(),
            state: DeliveryState::Created,
        }
    }
}

/// Payload of a packet record: everything needed to resend the envelope
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub envelope: CommandEnvelope,
    /// Target alias handed to the transport
    pub destination: String,
    /// Encoded datagram
    pub datagram: Bytes,
    /// Human-readable summary for logs and reports
    pub description: String,
}

/// Pick a random non-zero id for which `in_flight` returns false
pub fn generate_msg_id(in_flight: impl Fn(u32) -> bool) -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 && !in_flight(id) {
            return id;
        }
    }
}
