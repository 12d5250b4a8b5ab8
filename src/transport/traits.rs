//! Transport trait abstraction for pluggable datagram backends

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Something that happened on the link, reported to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Outcome of bringing the transport up
    Initialized { ok: bool, detail: String },
    /// A datagram from `sender` (alias when known, else the raw address)
    Received { sender: String, payload: Bytes },
    /// A peer came up or went away
    ConnectionChanged { peer: String, connected: bool },
}

/// Outbound side of a datagram transport
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hand one datagram to the link. Success means it left this host,
    /// not that the peer got it.
    async fn send(&self, destination: &str, payload: Bytes) -> Result<()>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
