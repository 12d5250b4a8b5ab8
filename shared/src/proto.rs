//! Envelope messages exchanged between the scheduler and field controllers.
//!
//! The messages are declared with `prost` derives directly instead of being
//! generated from a `.proto` file, so the crate builds without `protoc`.
//! Tags are stable and must not be reused.

/// Kind of unit carried by an [`Envelope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    MsgUnknown = 0,
    /// Debug command text (`DBGK ...`)
    MsgDebugCommand = 1,
    /// Universal/internal command text (`UCMD ...`)
    MsgUniversalCommand = 2,
    /// Valve open/close request sent to a field controller
    MsgValveControl = 3,
    /// Valve state query sent to a field controller
    MsgStateRequest = 4,
    /// Link-level acknowledgement of a message
    MsgAck = 5,
    /// The requested action has been carried out
    MsgActionDone = 6,
    /// Final response to a message
    MsgResponse = 7,
    /// Periodic liveness beacon
    MsgHeartbeat = 8,
}

/// Envelope-level header, present on every datagram.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    /// Random non-zero id, unique among in-flight envelopes
    #[prost(uint32, tag = "1")]
    pub msg_id: u32,
    #[prost(enumeration = "MessageKind", tag = "2")]
    pub kind: i32,
    /// Bitmask of confirmations the sender expects (see `confirm`)
    #[prost(uint32, tag = "3")]
    pub required: u32,
    /// UTC send time in microseconds since the Unix epoch
    #[prost(int64, tag = "4")]
    pub send_time_us: i64,
    #[prost(string, tag = "5")]
    pub sender: ::prost::alloc::string::String,
}

/// Open or close one valve on the receiving controller.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValveControl {
    #[prost(uint32, tag = "1")]
    pub valve_index: u32,
    #[prost(bool, tag = "2")]
    pub open: bool,
}

/// Ask a controller for the state of all of its valves.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateRequest {}

/// Valve states reported by a controller, index order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateReport {
    #[prost(bool, repeated, tag = "1")]
    pub valves_open: ::prost::alloc::vec::Vec<bool>,
}

/// Ack / action-done / response for a previously received message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Confirmation {
    /// `msg_id` of the message being confirmed
    #[prost(uint32, tag = "1")]
    pub confirms: u32,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, tag = "3")]
    pub message: ::prost::alloc::string::String,
    /// Only set on responses to a state request
    #[prost(message, optional, tag = "4")]
    pub report: ::core::option::Option<StateReport>,
}

/// Top-level datagram.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<Header>,
    #[prost(oneof = "envelope::Payload", tags = "2, 3, 4, 5")]
    pub payload: ::core::option::Option<envelope::Payload>,
}

/// Nested types for [`Envelope`].
pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        /// Command text for debug/universal commands
        #[prost(string, tag = "2")]
        Text(::prost::alloc::string::String),
        #[prost(message, tag = "3")]
        ValveControl(super::ValveControl),
        #[prost(message, tag = "4")]
        StateRequest(super::StateRequest),
        #[prost(message, tag = "5")]
        Confirmation(super::Confirmation),
    }
}
