//! Command dispatcher: moves work between the transport, the command queue
//! and the delivery trackers
//!
//! Three tasks run per dispatcher:
//! - Rx: drains transport events, refreshes peer liveness, queues work
//! - Tx: pops the queue, parses commands, sends and tracks envelopes
//! - Sweeper: retransmits or expires packets, notices silent peers and
//!   fires armed schedules (see [`sweeper`])
//!
//! No task holds more than one of the queue, store or schedule book locks
//! at a time.

mod report;
mod sweeper;

pub use report::{DeliveryReport, ExpiryReason};

use crate::clock::Clock;
use crate::command::{self, CommandArgs, DebugCommand};
use crate::config::EngineConfig;
use crate::envelope::{generate_msg_id, CommandEnvelope, OutboundPacket};
use crate::error::{QueueError, StoreError, TimeUpdateError};
use crate::journal::{CommandJournal, JournalKey};
use crate::queue::CommandQueue;
use crate::schedule::{Schedule, Verdict};
use crate::shutdown::Shutdown;
use crate::store::packet::PacketFault;
use crate::store::service::ServiceFault;
use crate::store::{PacketStore, ServiceStore};
use crate::transport::{Transport, TransportEvent};
use bytes::Bytes;
use chrono::NaiveDateTime;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use valvelink_shared::codec::{self, Datagram};
use valvelink_shared::state_machine::{is_valid_transition, DeliveryState};
use valvelink_shared::{confirm, envelope, Confirmation, Envelope, MessageKind};

/// One unit of work for the Tx worker
#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    /// Raw command text received from `sender`
    Command { sender: String, text: Bytes },
    /// Ack, action-done or response for one of our envelopes
    Confirmation {
        sender: String,
        kind: MessageKind,
        confirmation: Confirmation,
    },
    /// An armed schedule came due
    Fire(DebugCommand),
    /// A tracked packet timed out and must go out again
    Resend(u32),
}

/// A command waiting for its schedule
struct Armed {
    cmd: DebugCommand,
    schedule: Schedule,
    journal_key: Option<JournalKey>,
}

/// Delivery and monitoring engine
pub struct Dispatcher {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn CommandJournal>,
    packets: PacketStore,
    services: ServiceStore,
    queue: CommandQueue<Work>,
    book: Mutex<Vec<Armed>>,
    reports: mpsc::UnboundedSender<DeliveryReport>,
    shutdown: Shutdown,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher and the stream of reports it will emit
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        journal: Arc<dyn CommandJournal>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DeliveryReport>) {
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            queue: CommandQueue::new(config.queue_capacity),
            config,
            transport,
            clock,
            journal,
            packets: PacketStore::new(),
            services: ServiceStore::new(),
            book: Mutex::new(Vec::new()),
            reports,
            shutdown: Shutdown::new(),
            handles: Mutex::new(Vec::new()),
        });
        (dispatcher, reports_rx)
    }

    /// Spawn the Rx, Tx and sweeper tasks
    pub fn start(self: &Arc<Self>, events: mpsc::Receiver<TransportEvent>) {
        info!(
            "Dispatcher starting on {} (tick {:?}, timeout {:?}, {} retransmits)",
            self.transport.name(),
            self.config.sweep_interval,
            self.config.response_timeout,
            self.config.max_retransmits
        );
        let rx = tokio::spawn(self.clone().rx_loop(events));
        let tx = tokio::spawn(self.clone().tx_loop());
        let sweep = tokio::spawn(self.clone().sweep_loop());
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([rx, tx, sweep]);
    }

    /// Stop every task: flip the signal, close the queue, join
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        self.queue.shutdown();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Dispatcher task failed: {}", e);
            }
        }
        info!("Dispatcher stopped");
    }

    /// Token the tasks watch; handy for tying other loops to the dispatcher
    pub fn shutdown_token(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// In-flight outbound packets
    pub fn packets(&self) -> &PacketStore {
        &self.packets
    }

    /// Peer liveness records
    pub fn services(&self) -> &ServiceStore {
        &self.services
    }

    /// Commands waiting for their schedule
    pub fn armed_count(&self) -> usize {
        self.book().len()
    }

    /// Queue command text as if `sender` had sent it
    pub fn submit(&self, sender: &str, text: impl Into<Bytes>) -> Result<(), QueueError> {
        self.queue.push(Work::Command {
            sender: sender.to_string(),
            text: text.into(),
        })
    }

    /// Record the outcome of handing `msg_id` to the transport
    pub fn register_sent_msg(&self, msg_id: u32, ok: bool) -> Result<DeliveryState, StoreError> {
        let before = self.packets.delivery_state(msg_id)?;
        self.packets.register_sent(msg_id, ok)?;
        let after = self.packets.delivery_state(msg_id)?;

        if !is_valid_transition(before, after) {
            warn!("[TX] msg {} moved {:?} -> {:?}", msg_id, before, after);
        } else {
            debug!("[TX] msg {} {:?} -> {:?}", msg_id, before, after);
        }
        Ok(after)
    }

    /// Re-arm a persisted `period`/`event` command after a restart.
    ///
    /// Returns false for commands that cannot be armed this way. The command
    /// is not written back to the journal.
    pub fn insert_reloaded_cmd(&self, cmd: DebugCommand) -> bool {
        self.arm_reloaded(cmd, None)
    }

    /// Re-arm everything the journal still holds; returns how many were armed
    pub fn reload_journal(&self) -> anyhow::Result<usize> {
        let mut armed = 0;
        for (key, cmd) in self.journal.reload()? {
            if self.arm_reloaded(cmd, Some(key)) {
                armed += 1;
            } else if let Err(e) = self.journal.retire(key) {
                warn!("Cannot drop journal entry {}: {:#}", key, e);
            }
        }
        info!("Re-armed {} journaled command(s)", armed);
        Ok(armed)
    }

    fn arm_reloaded(&self, cmd: DebugCommand, key: Option<JournalKey>) -> bool {
        let reloadable = matches!(cmd.args(), CommandArgs::ValveCtrl { .. })
            && cmd.schedule().is_persistent();
        if !reloadable {
            warn!("Not re-arming '{}': only period/event valve commands persist", cmd);
            return false;
        }

        let schedule = Schedule::new(cmd.schedule(), self.clock.now());
        info!("Re-armed '{}'", cmd);
        self.book().push(Armed {
            cmd,
            schedule,
            journal_key: key,
        });
        true
    }

    fn book(&self) -> MutexGuard<'_, Vec<Armed>> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, report: DeliveryReport) {
        // Nobody listening is not an error for the engine
        let _ = self.reports.send(report);
    }

    fn enqueue(&self, work: Work) {
        match self.queue.push(work) {
            Ok(()) => {}
            Err(QueueError::Closed) => debug!("Queue closed, dropping work"),
            Err(e) => warn!("Dropping work: {}", e),
        }
    }

    // --- Rx ---------------------------------------------------------------

    async fn rx_loop(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.wait() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        info!("[RX] Transport event stream closed");
                        break;
                    }
                },
            };
            self.on_transport_event(event);
        }
        debug!("[RX] Loop exited");
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Initialized { ok: true, detail } => {
                info!("[RX] Transport ready: {}", detail)
            }
            TransportEvent::Initialized { ok: false, detail } => {
                error!("[RX] Transport failed to initialize: {}", detail)
            }
            TransportEvent::ConnectionChanged {
                peer,
                connected: true,
            } => self.peer_alive(&peer),
            TransportEvent::ConnectionChanged {
                peer,
                connected: false,
            } => self.peer_lost(&peer, ServiceFault::Disconnected),
            TransportEvent::Received { sender, payload } => self.on_datagram(sender, &payload),
        }
    }

    /// Only heartbeats and confirmations count as signs of life; command
    /// consoles and malformed traffic never create a peer record
    fn on_datagram(&self, sender: String, payload: &[u8]) {
        let envelope = match codec::classify(payload) {
            Ok(Datagram::Text(text)) => {
                self.enqueue(Work::Command { sender, text });
                return;
            }
            Ok(Datagram::Envelope(envelope)) => envelope,
            Err(e) => {
                warn!("[RX] Dropping malformed datagram from {}: {}", sender, e);
                return;
            }
        };

        let kind = envelope.kind();
        match (kind, envelope.payload) {
            (
                MessageKind::MsgDebugCommand | MessageKind::MsgUniversalCommand,
                Some(envelope::Payload::Text(text)),
            ) => self.enqueue(Work::Command {
                sender,
                text: Bytes::from(text),
            }),
            (
                MessageKind::MsgAck | MessageKind::MsgActionDone | MessageKind::MsgResponse,
                Some(envelope::Payload::Confirmation(confirmation)),
            ) => {
                self.peer_alive(&sender);
                self.enqueue(Work::Confirmation {
                    sender,
                    kind,
                    confirmation,
                });
            }
            (MessageKind::MsgHeartbeat, _) => {
                debug!("[RX] Heartbeat from {}", sender);
                self.peer_alive(&sender);
            }
            (kind, _) => warn!("[RX] Dropping unexpected {:?} from {}", kind, sender),
        }
    }

    fn peer_alive(&self, peer: &str) {
        match self.services.refresh(peer) {
            Ok(true) => {
                info!("[RX] Peer {} is up", peer);
                self.report(DeliveryReport::ServiceUp {
                    peer: peer.to_string(),
                });
            }
            Ok(false) => {}
            Err(e) => warn!("[RX] Cannot refresh peer {}: {}", peer, e),
        }
    }

    fn peer_lost(&self, peer: &str, reason: ServiceFault) {
        match self.services.mark_unavailable(peer, reason) {
            Ok(true) => {
                warn!("[{}] Peer {} is down ({:?})", tag(reason), peer, reason);
                self.report(DeliveryReport::ServiceDown {
                    peer: peer.to_string(),
                    reason,
                });
            }
            Ok(false) => {}
            Err(StoreError::NotFound(_)) => debug!("Unknown peer {} went away", peer),
            Err(e) => warn!("Cannot mark peer {} down: {}", peer, e),
        }
    }

    // --- Tx ---------------------------------------------------------------

    async fn tx_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_triggered() {
                if !self.queue.is_empty() {
                    info!("[TX] Abandoning {} queued item(s)", self.queue.len());
                }
                break;
            }
            match self.queue.pop().await {
                Ok(work) => self.execute(work).await,
                Err(QueueError::Closed) => {
                    debug!("[TX] Queue closed");
                    break;
                }
                Err(e) => warn!("[TX] Queue error: {}", e),
            }
        }
        debug!("[TX] Loop exited");
    }

    async fn execute(&self, work: Work) {
        match work {
            Work::Command { sender, text } => match command::parse(&text, &sender) {
                Ok(cmd) => self.accept(cmd).await,
                Err(e) => warn!("[TX] Rejected command from {}: {}", sender, e),
            },
            Work::Confirmation {
                sender,
                kind,
                confirmation,
            } => self.on_confirmation(&sender, kind, confirmation),
            Work::Fire(cmd) => self.send_command(&cmd).await,
            Work::Resend(msg_id) => self.resend(msg_id).await,
        }
    }

    /// A freshly parsed command: run it now or arm its schedule
    async fn accept(&self, cmd: DebugCommand) {
        if let CommandArgs::TimeSync { at } = cmd.args() {
            self.time_sync(*at);
            return;
        }

        let now = self.clock.now();
        let mut schedule = Schedule::new(cmd.schedule(), now);
        match schedule.evaluate(now, self.config.schedule_tolerance) {
            Verdict::Due { .. } => self.send_command(&cmd).await,
            Verdict::Pending { next } => info!("[TX] Armed '{}' for {}", cmd, next),
            Verdict::Missed { at } => {
                warn!("[TX] '{}' is already past ({})", cmd, at);
                self.report(DeliveryReport::ScheduleMissed {
                    command: cmd.to_string(),
                    at,
                });
            }
            Verdict::Retired => {}
        }

        if schedule.is_retired() {
            return;
        }

        let journal_key = if schedule.descriptor().is_persistent() {
            match self.journal.persist(&cmd) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("[TX] Cannot journal '{}': {:#}", cmd, e);
                    None
                }
            }
        } else {
            None
        };
        self.book().push(Armed {
            cmd,
            schedule,
            journal_key,
        });
    }

    fn time_sync(&self, at: NaiveDateTime) {
        match self.clock.set_time(at) {
            Ok(()) => {
                info!("[TX] System time set to {}", at);
                self.report(DeliveryReport::TimeSynced { at });
            }
            Err(e @ TimeUpdateError::PermissionDenied) => warn!("[TX] time-sync to {}: {}", at, e),
            Err(e) => error!("[TX] time-sync to {} failed: {}", at, e),
        }
    }

    /// Build, track and send the envelope for a due command
    async fn send_command(&self, cmd: &DebugCommand) {
        let Some(target) = cmd.target_alias() else {
            warn!("[TX] '{}' has no target, nothing to send", cmd);
            return;
        };

        let msg_id = generate_msg_id(|id| self.packets.is_there(&id));
        let node = self.config.node_id.as_str();
        let envelope = match cmd.args() {
            CommandArgs::ValveCtrl {
                valve_index, how, ..
            } => Envelope::valve_control(node, msg_id, u32::from(*valve_index), how.is_open()),
            CommandArgs::State { .. } => Envelope::state_request(node, msg_id),
            CommandArgs::TimeSync { .. } => return,
        };
        let required = envelope.header.as_ref().map_or(0, |h| h.required);

        let datagram = match codec::encode(&envelope) {
            Ok(datagram) => datagram,
            Err(e) => {
                error!("[TX] Cannot encode '{}': {}", cmd, e);
                return;
            }
        };

        let packet = OutboundPacket {
            envelope: CommandEnvelope::new(msg_id, required),
            destination: target.to_string(),
            datagram: datagram.clone(),
            description: cmd.to_string(),
        };
        if let Err(e) = self.packets.track(packet) {
            error!("[TX] Cannot track msg {}: {}", msg_id, e);
            return;
        }

        info!(">>> Sending '{}' as msg {}", cmd, msg_id);
        if self.transmit(msg_id, target, datagram).await {
            self.report(DeliveryReport::Sent {
                msg_id,
                target: target.to_string(),
                description: cmd.to_string(),
            });
        }
    }

    async fn resend(&self, msg_id: u32) {
        let packet = self.packets.with_record(&msg_id, |r| {
            (r.payload().destination.clone(), r.payload().datagram.clone())
        });
        match packet {
            Ok((destination, datagram)) => {
                self.transmit(msg_id, &destination, datagram).await;
            }
            Err(_) => debug!("[TX] msg {} settled before its resend", msg_id),
        }
    }

    async fn transmit(&self, msg_id: u32, destination: &str, datagram: Bytes) -> bool {
        let ok = match self.transport.send(destination, datagram).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[TX] Send of msg {} to {} failed: {:#}", msg_id, destination, e);
                false
            }
        };
        if let Err(e) = self.register_sent_msg(msg_id, ok) {
            debug!("[TX] msg {} gone before send result: {}", msg_id, e);
        }
        ok
    }

    fn on_confirmation(&self, sender: &str, kind: MessageKind, confirmation: Confirmation) {
        let bit = match kind {
            MessageKind::MsgAck => confirm::ACK,
            MessageKind::MsgActionDone => confirm::ACTION,
            MessageKind::MsgResponse => confirm::RESPONSE,
            _ => return,
        };
        let msg_id = confirmation.confirms;

        if !confirmation.success {
            if self
                .packets
                .update_error(&msg_id, PacketFault::Rejected, 1)
                .is_ok()
            {
                self.expire(
                    msg_id,
                    ExpiryReason::Rejected {
                        by: sender.to_string(),
                        message: confirmation.message,
                    },
                );
            } else {
                info!("<<< Rejection of unknown msg {} from {}", msg_id, sender);
            }
            return;
        }

        let flags = match self.packets.confirm(msg_id, bit) {
            Ok(flags) => flags,
            Err(StoreError::NotFound(_)) => {
                info!("<<< {:?} for unknown msg {} from {}", kind, msg_id, sender);
                return;
            }
            Err(e) => {
                warn!("<<< Cannot record {:?} for msg {}: {}", kind, msg_id, e);
                return;
            }
        };

        let valves = confirmation.report.map(|r| r.valves_open);
        if !flags.is_confirmed() {
            debug!("<<< {:?} for msg {}: {:?}", kind, msg_id, flags.delivery_state());
            if let Some(valves) = valves {
                info!("<<< {} reports valves {:?}", sender, valves);
            }
            return;
        }

        match self.packets.remove(&msg_id) {
            Ok(packet) => {
                info!("<<< msg {} confirmed by {}", msg_id, sender);
                self.report(DeliveryReport::Confirmed {
                    msg_id,
                    target: packet.destination,
                    description: packet.description,
                    valves,
                });
            }
            Err(e) => debug!("<<< msg {} already settled: {}", msg_id, e),
        }
    }

    /// Give up on a packet: flag it, drop it, report it
    fn expire(&self, msg_id: u32, reason: ExpiryReason) {
        if let Err(e) = self.packets.mark_expired(msg_id) {
            debug!("msg {} already settled: {}", msg_id, e);
            return;
        }
        match self.packets.remove(&msg_id) {
            Ok(packet) => {
                warn!("msg {} ('{}') expired: {}", msg_id, packet.description, reason);
                self.report(DeliveryReport::Expired {
                    msg_id,
                    target: packet.destination,
                    description: packet.description,
                    reason,
                });
            }
            Err(e) => debug!("msg {} already settled: {}", msg_id, e),
        }
    }
}

fn tag(reason: ServiceFault) -> &'static str {
    match reason {
        ServiceFault::Disconnected => "RX",
        ServiceFault::Silent => "SWEEP",
    }
}

#[cfg(test)]
mod tests;
