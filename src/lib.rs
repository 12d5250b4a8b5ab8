//! Valve command delivery and monitoring engine
//!
//! Parses operator commands, schedules them, delivers them to field
//! controllers over an unreliable datagram link and tracks every envelope
//! until it is confirmed or expires.

pub mod clock;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod journal;
pub mod queue;
pub mod schedule;
pub mod shutdown;
pub mod store;
pub mod transport;

pub use dispatcher::{DeliveryReport, Dispatcher};
