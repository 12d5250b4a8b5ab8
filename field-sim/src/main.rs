//! Field controller simulator
//!
//! Answers `ValveControl` with ack, action-done and response, answers
//! `StateRequest` with ack and a response carrying the valve states, and
//! sends a heartbeat to the scheduler every second.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use valvelink_shared::{
    codec, envelope, timing, Confirmation, Envelope, MessageKind, StateReport,
};

const VALVES: usize = 4;

#[derive(Debug, Parser)]
#[command(name = "field-sim", about = "Simulated valve field controller")]
struct Cli {
    /// UDP address to listen on
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0:5684")]
    bind: SocketAddr,

    /// Scheduler address receiving heartbeats
    #[arg(short = 's', long = "scheduler", default_value = "127.0.0.1:5683")]
    scheduler: SocketAddr,

    /// Name put in outbound headers
    #[arg(short = 'n', long = "node-id", default_value = "alias_udp_valve")]
    node_id: String,

    /// Delay between consecutive confirmations, in milliseconds
    #[arg(short = 'd', long = "step-delay-ms", default_value_t = 200)]
    step_delay_ms: u64,

    /// Valve that fails every actuation
    #[arg(short = 'j', long = "jammed")]
    jammed: Option<u32>,
}

struct Controller {
    socket: UdpSocket,
    node_id: String,
    step_delay: Duration,
}

impl Controller {
    async fn reply(&self, to: SocketAddr, kind: MessageKind, confirmation: Confirmation) {
        let envelope = Envelope::confirmation(self.node_id.clone(), kind, confirmation);
        match codec::encode(&envelope) {
            Ok(datagram) => {
                if let Err(e) = self.socket.send_to(&datagram, to).await {
                    warn!("Reply to {} failed: {}", to, e);
                }
            }
            Err(e) => warn!("Cannot encode {:?}: {}", kind, e),
        }
    }

    /// Ack, then the remaining confirmations the request asked for
    async fn confirm(
        self: Arc<Self>,
        to: SocketAddr,
        msg_id: u32,
        action: Option<Result<(), String>>,
        report: Vec<bool>,
    ) {
        self.reply(to, MessageKind::MsgAck, Confirmation::ok(msg_id)).await;

        if let Some(outcome) = action {
            tokio::time::sleep(self.step_delay).await;
            let done = match outcome {
                Ok(()) => Confirmation::ok(msg_id),
                Err(message) => Confirmation::failed(msg_id, message),
            };
            let failed = !done.success;
            self.reply(to, MessageKind::MsgActionDone, done).await;
            if failed {
                return;
            }
        }

        tokio::time::sleep(self.step_delay).await;
        let mut response = Confirmation::ok(msg_id);
        response.report = Some(StateReport { valves_open: report });
        self.reply(to, MessageKind::MsgResponse, response).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let socket = UdpSocket::bind(cli.bind)
        .await
        .with_context(|| format!("Cannot bind {}", cli.bind))?;
    info!("Field controller {} listening on {}", cli.node_id, socket.local_addr()?);
    info!("  heartbeats to {}", cli.scheduler);

    let controller = Arc::new(Controller {
        socket,
        node_id: cli.node_id,
        step_delay: Duration::from_millis(cli.step_delay_ms),
    });
    let heartbeat = codec::encode(&Envelope::heartbeat(controller.node_id.clone()))?;

    let mut valves = [false; VALVES];
    let mut ticker = tokio::time::interval(Duration::from_millis(timing::HEARTBEAT_INTERVAL_MS));
    let mut buf = vec![0u8; codec::MAX_DATAGRAM_SIZE];

    loop {
        let (n, from) = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if let Err(e) = controller.socket.send_to(&heartbeat, cli.scheduler).await {
                    debug!("Heartbeat failed: {}", e);
                }
                continue;
            }
            r = controller.socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    debug!("Receive error: {}", e);
                    continue;
                }
            },
        };

        let envelope = match codec::decode(&buf[..n]) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", from, e);
                continue;
            }
        };
        let msg_id = envelope.header.as_ref().map_or(0, |h| h.msg_id);
        let kind = envelope.kind();

        match envelope.payload {
            Some(envelope::Payload::ValveControl(vc)) => {
                let index = vc.valve_index as usize;
                let outcome = if index >= VALVES {
                    Err(format!("no valve {}", vc.valve_index))
                } else if cli.jammed == Some(vc.valve_index) {
                    Err(format!("valve {} jammed", vc.valve_index))
                } else {
                    valves[index] = vc.open;
                    Ok(())
                };
                info!(
                    "msg {} from {}: valve {} {} -> {:?}",
                    msg_id,
                    from,
                    vc.valve_index,
                    if vc.open { "open" } else { "close" },
                    outcome
                );
                tokio::spawn(controller.clone().confirm(from, msg_id, Some(outcome), valves.to_vec()));
            }
            Some(envelope::Payload::StateRequest(_)) => {
                info!("msg {} from {}: state {:?}", msg_id, from, valves);
                tokio::spawn(controller.clone().confirm(from, msg_id, None, valves.to_vec()));
            }
            _ => debug!("Ignoring {:?} from {}", kind, from),
        }
    }

    info!("Field controller stopping");
    Ok(())
}
