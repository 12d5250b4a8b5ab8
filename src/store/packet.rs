//! Packet records: confirmation and retransmission tracking per `msg_id`

use super::{BitSet, RecordSpec, Tracked, TrackedStore};
use crate::envelope::OutboundPacket;
use crate::error::StoreError;
use std::fmt;
use valvelink_shared::confirm;
use valvelink_shared::state_machine::{DeliveryProgress, DeliveryState};

/// Fields of [`PacketFlags`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketField {
    /// 2-bit retransmission counter (0..=3)
    Retransmits,
    SentOk,
    AckReceived,
    ActionDone,
    ResponseReceived,
    AckRequired,
    ActionRequired,
    ResponseRequired,
    ErrorOccurred,
}

impl PacketField {
    /// (shift, width) inside the packed word
    const fn layout(self) -> (u16, u16) {
        match self {
            PacketField::Retransmits => (0, 2),
            PacketField::SentOk => (2, 1),
            PacketField::AckReceived => (3, 1),
            PacketField::ActionDone => (4, 1),
            PacketField::ResponseReceived => (5, 1),
            PacketField::AckRequired => (6, 1),
            PacketField::ActionRequired => (7, 1),
            PacketField::ResponseRequired => (8, 1),
            PacketField::ErrorOccurred => (9, 1),
        }
    }

    /// Received-flag matching a [`confirm`] bit
    pub fn for_confirmation(bit: u32) -> Option<Self> {
        match bit {
            confirm::ACK => Some(PacketField::AckReceived),
            confirm::ACTION => Some(PacketField::ActionDone),
            confirm::RESPONSE => Some(PacketField::ResponseReceived),
            _ => None,
        }
    }
}

/// Packed packet flags, layout:
/// ```text
/// bit  9      8     7      6     5     4      3    2     1..0
///     error  rsp-r act-r  ack-r  rsp  action  ack  sent  retransmits
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u16);

impl PacketFlags {
    pub const MAX_RETRANSMITS: u8 = 0b11;

    /// Flags with the `*Required` bits set from a [`confirm`] mask
    pub fn with_required(required: u32) -> Self {
        let mut flags = Self::default();
        flags.set(PacketField::AckRequired, (required & confirm::ACK != 0) as u8);
        flags.set(PacketField::ActionRequired, (required & confirm::ACTION != 0) as u8);
        flags.set(PacketField::ResponseRequired, (required & confirm::RESPONSE != 0) as u8);
        flags
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits & 0x03ff)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn retransmits(self) -> u8 {
        self.get(PacketField::Retransmits)
    }

    pub fn sent_ok(self) -> bool {
        self.get(PacketField::SentOk) == 1
    }

    pub fn error_occurred(self) -> bool {
        self.get(PacketField::ErrorOccurred) == 1
    }

    /// Required confirmations as a [`confirm`] mask
    pub fn required(self) -> u32 {
        let mut mask = 0;
        if self.get(PacketField::AckRequired) == 1 {
            mask |= confirm::ACK;
        }
        if self.get(PacketField::ActionRequired) == 1 {
            mask |= confirm::ACTION;
        }
        if self.get(PacketField::ResponseRequired) == 1 {
            mask |= confirm::RESPONSE;
        }
        mask
    }

    /// Received confirmations as a [`confirm`] mask
    pub fn received(self) -> u32 {
        let mut mask = 0;
        if self.get(PacketField::AckReceived) == 1 {
            mask |= confirm::ACK;
        }
        if self.get(PacketField::ActionDone) == 1 {
            mask |= confirm::ACTION;
        }
        if self.get(PacketField::ResponseReceived) == 1 {
            mask |= confirm::RESPONSE;
        }
        mask
    }

    /// All required confirmations received
    pub fn is_confirmed(self) -> bool {
        self.required() & !self.received() == 0
    }

    /// Delivery state these flags represent
    pub fn delivery_state(self) -> DeliveryState {
        DeliveryState::from_progress(DeliveryProgress {
            required: self.required(),
            received: self.received(),
            sent: self.sent_ok(),
            attempts: self.retransmits(),
            errored: self.error_occurred(),
        })
    }
}

impl BitSet for PacketFlags {
    type Field = PacketField;

    fn get(&self, field: PacketField) -> u8 {
        let (shift, width) = field.layout();
        ((self.0 >> shift) & ((1 << width) - 1)) as u8
    }

    fn set(&mut self, field: PacketField, value: u8) {
        let (shift, width) = field.layout();
        let mask = (1u16 << width) - 1;
        let value = (value as u16).min(mask);
        self.0 = (self.0 & !(mask << shift)) | (value << shift);
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketFlags")
            .field("retransmits", &self.retransmits())
            .field("sent", &self.sent_ok())
            .field("required", &self.required())
            .field("received", &self.received())
            .field("error", &self.error_occurred())
            .finish()
    }
}

/// Fault bits of a packet record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFault {
    /// Transport could not send the datagram
    SendFailed,
    /// Response window elapsed at least once
    Timeout,
    /// Retransmissions exhausted
    Expired,
    /// Controller answered with `success = false`
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFaults(u8);

impl PacketFaults {
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitSet for PacketFaults {
    type Field = PacketFault;

    fn get(&self, field: PacketFault) -> u8 {
        (self.0 >> field as u8) & 1
    }

    fn set(&mut self, field: PacketFault, value: u8) {
        let bit = 1 << field as u8;
        if value != 0 {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Record spec for outbound envelopes keyed by `msg_id`
pub struct PacketSpec;

impl RecordSpec for PacketSpec {
    type Id = u32;
    type Flags = PacketFlags;
    type Errors = PacketFaults;
    type Payload = OutboundPacket;

    fn on_flag_changed(record: &mut Tracked<Self>, field: PacketField, old: u8, new: u8) {
        // Every successful (re)send restarts the response window
        if field == PacketField::SentOk && new == 1 {
            record.touch();
        }
        if old != new {
            record.payload.envelope.state = record.flags.delivery_state();
        }
    }
}

pub type PacketStore = TrackedStore<PacketSpec>;

impl TrackedStore<PacketSpec> {
    /// Start tracking an outbound packet with its required confirmations set
    pub fn track(&self, packet: OutboundPacket) -> Result<(), StoreError> {
        let flags = PacketFlags::with_required(packet.envelope.required);
        self.insert_with(packet.envelope.msg_id, packet, flags)
    }

    /// Current delivery state of a packet
    pub fn delivery_state(&self, msg_id: u32) -> Result<DeliveryState, StoreError> {
        self.flags(&msg_id).map(PacketFlags::delivery_state)
    }

    /// Record the outcome of handing the packet to the transport
    pub fn register_sent(&self, msg_id: u32, ok: bool) -> Result<(), StoreError> {
        self.update(&msg_id, PacketField::SentOk, ok as u8)?;
        if !ok {
            self.update_error(&msg_id, PacketFault::SendFailed, 1)?;
        }
        Ok(())
    }

    /// Set the received flag for a [`confirm`] bit, returning the new flags
    pub fn confirm(&self, msg_id: u32, bit: u32) -> Result<PacketFlags, StoreError> {
        if let Some(field) = PacketField::for_confirmation(bit) {
            self.update(&msg_id, field, 1)?;
        }
        self.flags(&msg_id)
    }

    /// Count one retransmission and mark the packet unsent; returns the count
    pub fn note_retransmit(&self, msg_id: u32) -> Result<u8, StoreError> {
        self.update_error(&msg_id, PacketFault::Timeout, 1)?;
        let count = self.update_with(&msg_id, PacketField::Retransmits, |c| c.saturating_add(1))?;
        self.update(&msg_id, PacketField::SentOk, 0)?;
        Ok(count)
    }

    /// Undo [`note_retransmit`](Self::note_retransmit) for a resend that
    /// never got queued, restoring the counter and sent flag from `before`
    pub fn withdraw_retransmit(&self, msg_id: u32, before: PacketFlags) -> Result<(), StoreError> {
        self.update(&msg_id, PacketField::Retransmits, before.retransmits())?;
        self.update(&msg_id, PacketField::SentOk, before.sent_ok() as u8)
    }

    /// Flag the packet as failed for good
    pub fn mark_expired(&self, msg_id: u32) -> Result<(), StoreError> {
        self.update_error(&msg_id, PacketFault::Expired, 1)?;
        self.update(&msg_id, PacketField::ErrorOccurred, 1)
    }
}
