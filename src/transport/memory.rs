//! In-process transport that records what would have gone on the wire

use crate::transport::traits::Transport;
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One datagram handed to a [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentDatagram {
    pub destination: String,
    pub payload: Bytes,
}

/// Loopback transport for tests and dry runs
pub struct MemoryTransport {
    sent: mpsc::UnboundedSender<SentDatagram>,
    offline: AtomicBool,
}

impl MemoryTransport {
    /// Transport plus the receiving end of everything it sends
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SentDatagram>) {
        let (sent, rx) = mpsc::unbounded_channel();
        (
            Self {
                sent,
                offline: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// While offline every send fails
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, destination: &str, payload: Bytes) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("link to {} is down", destination);
        }
        // A dropped receiver just means nobody is watching
        let _ = self.sent.send(SentDatagram {
            destination: destination.to_string(),
            payload,
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
