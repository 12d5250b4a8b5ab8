//! UDP transport for field controller links

use crate::shutdown::Shutdown;
use crate::transport::traits::{Transport, TransportEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use valvelink_shared::codec::MAX_DATAGRAM_SIZE;

/// A bound UDP socket plus the alias table of known peers
pub struct UdpTransport {
    socket: UdpSocket,
    /// alias -> address
    peers: HashMap<String, SocketAddr>,
    /// address -> alias
    aliases: HashMap<SocketAddr, String>,
}

impl UdpTransport {
    /// Bind to `addr` and learn the `alias -> address` table
    pub async fn bind(addr: SocketAddr, peers: HashMap<String, SocketAddr>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Cannot bind UDP socket on {}", addr))?;
        let aliases = peers.iter().map(|(alias, a)| (*a, alias.clone())).collect();
        Ok(Self {
            socket,
            peers,
            aliases,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Address for an alias, or the destination itself if it is an address
    pub fn resolve(&self, destination: &str) -> Result<SocketAddr> {
        if let Some(addr) = self.peers.get(destination) {
            return Ok(*addr);
        }
        destination
            .parse()
            .with_context(|| format!("Unknown peer alias: {}", destination))
    }

    /// Alias of `addr` when known, else its textual form
    pub fn sender_name(&self, addr: SocketAddr) -> String {
        self.aliases
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| addr.to_string())
    }

    /// Receive loop: forwards every datagram as a [`TransportEvent`] until
    /// shutdown or until the event consumer goes away
    pub async fn run(self: Arc<Self>, events: mpsc::Sender<TransportEvent>, shutdown: Shutdown) {
        let detail = match self.local_addr() {
            Ok(addr) => format!("udp listening on {}", addr),
            Err(e) => format!("udp socket without local address: {}", e),
        };
        if events
            .send(TransportEvent::Initialized { ok: true, detail })
            .await
            .is_err()
        {
            return;
        }

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = tokio::select! {
                _ = shutdown.wait() => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        // Linux reports ICMP port-unreachable from an earlier
                        // send here; the socket itself is fine
                        warn!("UDP receive error: {}", e);
                        continue;
                    }
                },
            };

            let event = TransportEvent::Received {
                sender: self.sender_name(from),
                payload: Bytes::copy_from_slice(&buf[..n]),
            };
            if events.send(event).await.is_err() {
                debug!("Event consumer gone, stopping UDP receive loop");
                break;
            }
        }
        info!("UDP receive loop stopped");
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, destination: &str, payload: Bytes) -> Result<()> {
        let addr = self.resolve(destination)?;
        let n = self.socket.send_to(&payload, addr).await?;
        anyhow::ensure!(n == payload.len(), "short UDP send to {}: {}/{}", addr, n, payload.len());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "UDP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_alias_resolution() {
        let peers = HashMap::from([("alias_udp_valve".to_string(), "10.0.0.2:5683".parse().unwrap())]);
        let t = UdpTransport::bind(loopback(), peers).await.unwrap();

        assert_eq!(t.resolve("alias_udp_valve").unwrap(), "10.0.0.2:5683".parse().unwrap());
        assert_eq!(t.resolve("10.0.0.3:1").unwrap(), "10.0.0.3:1".parse().unwrap());
        assert!(t.resolve("nobody").is_err());
        assert_eq!(t.sender_name("10.0.0.2:5683".parse().unwrap()), "alias_udp_valve");
        assert_eq!(t.sender_name("10.0.0.9:7".parse().unwrap()), "10.0.0.9:7");
        assert_eq!(t.name(), "UDP");
    }

    #[tokio::test]
    async fn test_datagrams_become_events() {
        let a = UdpTransport::bind(loopback(), HashMap::new()).await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b = UdpTransport::bind(loopback(), HashMap::from([("field".to_string(), a_addr)]))
            .await
            .unwrap();
        let b_addr = b.local_addr().unwrap();
        let b = Arc::new(b);

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(b.clone().run(tx, shutdown.clone()));

        assert!(matches!(rx.recv().await, Some(TransportEvent::Initialized { ok: true, .. })));

        a.send(&b_addr.to_string(), Bytes::from_static(b"DBGK state field"))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Received {
                sender: "field".into(),
                payload: Bytes::from_static(b"DBGK state field"),
            })
        );

        shutdown.trigger();
        task.await.unwrap();
    }
}
