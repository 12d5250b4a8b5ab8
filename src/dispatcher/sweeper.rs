//! Periodic sweep over packets, peers and armed schedules

use super::{Dispatcher, DeliveryReport, ExpiryReason, Work};
use crate::error::QueueError;
use crate::schedule::Verdict;
use crate::store::service::ServiceFault;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

impl Dispatcher {
    pub(super) async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            if self.shutdown.is_triggered() {
                break;
            }
            self.sweep();
        }
        debug!("[SWEEP] Loop exited");
    }

    /// One sweeper pass
    pub fn sweep(&self) {
        self.sweep_packets();
        self.sweep_services();
        self.sweep_schedules();
    }

    /// Retransmit or expire packets whose response window elapsed
    fn sweep_packets(&self) {
        let timeout = self.config.response_timeout;
        let mut timed_out = Vec::new();
        if let Err(e) = self.packets.for_each_elapsed(|msg_id, elapsed| {
            if elapsed > timeout {
                timed_out.push(*msg_id);
            }
            true
        }) {
            warn!("[SWEEP] Packet scan failed: {}", e);
            return;
        }

        for msg_id in timed_out {
            // Settled since the scan
            let Ok(flags) = self.packets.flags(&msg_id) else {
                continue;
            };
            if flags.is_confirmed() || flags.error_occurred() {
                continue;
            }

            if flags.retransmits() >= self.config.max_retransmits {
                self.expire(
                    msg_id,
                    ExpiryReason::Timeout {
                        retransmits: flags.retransmits(),
                    },
                );
                continue;
            }

            match self.packets.note_retransmit(msg_id) {
                Ok(count) => match self.queue.push(Work::Resend(msg_id)) {
                    Ok(()) => info!(
                        "[SWEEP] msg {} timed out, retransmit {}/{}",
                        msg_id, count, self.config.max_retransmits
                    ),
                    Err(e) => {
                        // Not counted; retried once the window elapses again
                        match e {
                            QueueError::Closed => debug!("[SWEEP] Resend of msg {} dropped: {}", msg_id, e),
                            _ => warn!("[SWEEP] Resend of msg {} deferred: {}", msg_id, e),
                        }
                        if let Err(e) = self.packets.withdraw_retransmit(msg_id, flags) {
                            debug!("[SWEEP] msg {} settled: {}", msg_id, e);
                        }
                    }
                },
                Err(e) => debug!("[SWEEP] msg {} settled: {}", msg_id, e),
            }
        }
    }

    /// Flip peers silent for longer than the disconnect delay, forget the
    /// ones unavailable for longer than the retention period
    fn sweep_services(&self) {
        match self.services.silent_peers(self.config.disconnect_delay) {
            Ok(peers) => {
                for peer in peers {
                    self.peer_lost(&peer, ServiceFault::Silent);
                }
            }
            Err(e) => warn!("[SWEEP] Service scan failed: {}", e),
        }

        match self.services.forget_stale(self.config.peer_retention) {
            Ok(peers) => {
                for peer in peers {
                    debug!("[SWEEP] Forgot peer {}", peer);
                }
            }
            Err(e) => warn!("[SWEEP] Service scan failed: {}", e),
        }
    }

    /// Fire due schedules, report missed ones, drop retired ones.
    ///
    /// A one-shot schedule whose fire cannot be queued stays armed, with
    /// its journal entry, and is evaluated again next tick.
    fn sweep_schedules(&self) {
        let now = self.clock.now();
        let tolerance = self.config.schedule_tolerance;

        // Taken out so the queue is never pushed under the book lock
        let armed = std::mem::take(&mut *self.book());
        let mut kept = Vec::with_capacity(armed.len());

        for mut entry in armed {
            let before = entry.schedule.clone();
            match entry.schedule.evaluate(now, tolerance) {
                Verdict::Due { at } => match self.queue.push(Work::Fire(entry.cmd.clone())) {
                    Ok(()) => info!("[SWEEP] '{}' due at {}", entry.cmd, at),
                    Err(e) if entry.schedule.descriptor().is_recurring() => {
                        // This week's occurrence is gone; the next one stays armed
                        warn!("[SWEEP] '{}' could not fire at {}: {}", entry.cmd, at, e);
                        self.report(DeliveryReport::ScheduleMissed {
                            command: entry.cmd.to_string(),
                            at,
                        });
                    }
                    Err(e) => {
                        warn!("[SWEEP] '{}' deferred: {}", entry.cmd, e);
                        entry.schedule = before;
                    }
                },
                Verdict::Missed { at } => {
                    warn!("[SWEEP] '{}' missed its instant {}", entry.cmd, at);
                    self.report(DeliveryReport::ScheduleMissed {
                        command: entry.cmd.to_string(),
                        at,
                    });
                }
                Verdict::Pending { .. } | Verdict::Retired => {}
            }

            if !entry.schedule.is_retired() {
                kept.push(entry);
            } else if let Some(key) = entry.journal_key {
                if let Err(e) = self.journal.retire(key) {
                    warn!("[SWEEP] Cannot retire journal entry {}: {:#}", key, e);
                }
            }
        }

        self.book().extend(kept);
    }
}
