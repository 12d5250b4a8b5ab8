use super::*;
use crate::clock::ManualClock;
use crate::journal::MemoryJournal;
use crate::transport::{MemoryTransport, SentDatagram};
use chrono::TimeDelta;
use std::time::Duration;
use valvelink_shared::StateReport;

struct Harness {
    dispatcher: Arc<Dispatcher>,
    reports: mpsc::UnboundedReceiver<DeliveryReport>,
    sent: mpsc::UnboundedReceiver<SentDatagram>,
    transport: Arc<MemoryTransport>,
    clock: Arc<ManualClock>,
    journal: Arc<MemoryJournal>,
}

impl Harness {
    fn new() -> Self {
        Self::with(ManualClock::new(at("2026-10-19 09:00:00")), Arc::new(MemoryJournal::new()))
    }

    fn with(clock: ManualClock, journal: Arc<MemoryJournal>) -> Self {
        let (transport, sent) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let clock = Arc::new(clock);
        let (dispatcher, reports) = Dispatcher::new(
            EngineConfig::default(),
            transport.clone(),
            clock.clone(),
            journal.clone(),
        );
        Self {
            dispatcher,
            reports,
            sent,
            transport,
            clock,
            journal,
        }
    }

    async fn command(&self, line: &str) {
        self.dispatcher
            .execute(Work::Command {
                sender: "console".into(),
                text: Bytes::copy_from_slice(line.as_bytes()),
            })
            .await;
    }

    /// Run everything the sweeper queued
    async fn drain(&self) {
        while let Some(work) = self.dispatcher.queue.try_pop() {
            self.dispatcher.execute(work).await;
        }
    }

    /// Occupy every slot of the command queue
    fn fill_queue(&self) {
        for _ in 0..self.dispatcher.config.queue_capacity {
            self.dispatcher
                .submit("console", "DBGK state alias_udp_valve")
                .unwrap();
        }
        assert!(matches!(
            self.dispatcher.submit("console", "DBGK state alias_udp_valve"),
            Err(QueueError::Full(_))
        ));
    }

    /// Throw away whatever is queued without running it
    fn clear_queue(&self) {
        while self.dispatcher.queue.try_pop().is_some() {}
    }

    fn confirm(&self, kind: MessageKind, confirmation: Confirmation) {
        self.dispatcher
            .on_confirmation("alias_udp_valve", kind, confirmation);
    }

    /// Next datagram on the wire, decoded
    fn next_sent(&mut self) -> (String, Envelope) {
        let sent = self.sent.try_recv().expect("nothing was sent");
        (sent.destination, codec::decode(&sent.payload).unwrap())
    }

    fn reports(&mut self) -> Vec<DeliveryReport> {
        let mut out = Vec::new();
        while let Ok(r) = self.reports.try_recv() {
            out.push(r);
        }
        out
    }
}

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn msg_id(envelope: &Envelope) -> u32 {
    envelope.header.as_ref().unwrap().msg_id
}

#[tokio::test]
async fn test_state_request_confirmed_with_report() {
    let mut h = Harness::new();
    h.command("DBGK state alias_udp_valve").await;

    let (destination, envelope) = h.next_sent();
    assert_eq!(destination, "alias_udp_valve");
    assert_eq!(envelope.kind(), MessageKind::MsgStateRequest);
    let id = msg_id(&envelope);
    assert_ne!(id, 0);
    assert_eq!(h.dispatcher.packets().delivery_state(id).unwrap(), DeliveryState::Sent);
    assert!(matches!(&h.reports()[..], [DeliveryReport::Sent { msg_id, .. }] if *msg_id == id));

    h.confirm(MessageKind::MsgAck, Confirmation::ok(id));
    assert_eq!(
        h.dispatcher.packets().delivery_state(id).unwrap(),
        DeliveryState::Awaiting { missing: confirm::RESPONSE }
    );

    let mut response = Confirmation::ok(id);
    response.report = Some(StateReport {
        valves_open: vec![true, false, false, true],
    });
    h.confirm(MessageKind::MsgResponse, response);

    assert_eq!(h.dispatcher.packets().size(), 0);
    assert_eq!(
        h.reports(),
        vec![DeliveryReport::Confirmed {
            msg_id: id,
            target: "alias_udp_valve".into(),
            description: "DBGK state alias_udp_valve".into(),
            valves: Some(vec![true, false, false, true]),
        }]
    );
}

#[tokio::test]
async fn test_valve_command_needs_every_confirmation() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 2 open now 0").await;
    let (_, envelope) = h.next_sent();
    let id = msg_id(&envelope);
    assert_eq!(envelope.header.as_ref().unwrap().required, confirm::ALL);

    h.confirm(MessageKind::MsgAck, Confirmation::ok(id));
    h.confirm(MessageKind::MsgResponse, Confirmation::ok(id));
    assert!(h.dispatcher.packets().is_there(&id));

    h.confirm(MessageKind::MsgActionDone, Confirmation::ok(id));
    assert!(!h.dispatcher.packets().is_there(&id));
    assert!(h
        .reports()
        .iter()
        .any(|r| matches!(r, DeliveryReport::Confirmed { msg_id, valves: None, .. } if *msg_id == id)));
}

#[tokio::test(start_paused = true)]
async fn test_retransmits_then_expires() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 0 open now 0").await;
    let (_, first) = h.next_sent();
    let id = msg_id(&first);

    // Inside the response window nothing happens
    tokio::time::advance(Duration::from_secs(2)).await;
    h.dispatcher.sweep();
    assert!(h.dispatcher.queue.is_empty());

    for attempt in 1..=3u8 {
        tokio::time::advance(Duration::from_secs(4)).await;
        h.dispatcher.sweep();
        assert_eq!(
            h.dispatcher.packets().delivery_state(id).unwrap(),
            DeliveryState::Retrying { attempt }
        );
        h.drain().await;

        let (_, resent) = h.next_sent();
        assert_eq!(msg_id(&resent), id);
        assert_eq!(h.dispatcher.packets().delivery_state(id).unwrap(), DeliveryState::Sent);
    }

    tokio::time::advance(Duration::from_secs(4)).await;
    h.dispatcher.sweep();
    h.drain().await;

    assert!(h.sent.try_recv().is_err(), "expired packets are never resent");
    assert!(!h.dispatcher.packets().is_there(&id));
    let reports = h.reports();
    assert!(reports.contains(&DeliveryReport::Expired {
        msg_id: id,
        target: "alias_udp_valve".into(),
        description: "DBGK valve-ctrl alias_udp_valve 0 open now 0".into(),
        reason: ExpiryReason::Timeout { retransmits: 3 },
    }));
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_is_retried() {
    let mut h = Harness::new();
    h.transport.set_offline(true);
    h.command("DBGK state alias_udp_valve").await;

    assert!(h.sent.try_recv().is_err());
    assert_eq!(h.dispatcher.packets().size(), 1);
    assert!(h.reports().is_empty());

    h.transport.set_offline(false);
    tokio::time::advance(Duration::from_secs(4)).await;
    h.dispatcher.sweep();
    h.drain().await;

    let (_, envelope) = h.next_sent();
    assert_eq!(envelope.kind(), MessageKind::MsgStateRequest);
}

#[tokio::test]
async fn test_rejection_expires_packet() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 1 close now 0").await;
    let (_, envelope) = h.next_sent();
    let id = msg_id(&envelope);
    h.reports();

    h.confirm(MessageKind::MsgActionDone, Confirmation::failed(id, "valve jammed"));

    assert!(!h.dispatcher.packets().is_there(&id));
    assert_eq!(
        h.reports(),
        vec![DeliveryReport::Expired {
            msg_id: id,
            target: "alias_udp_valve".into(),
            description: "DBGK valve-ctrl alias_udp_valve 1 close now 0".into(),
            reason: ExpiryReason::Rejected {
                by: "alias_udp_valve".into(),
                message: "valve jammed".into(),
            },
        }]
    );
}

#[tokio::test]
async fn test_unknown_confirmation_is_ignored() {
    let mut h = Harness::new();
    h.confirm(MessageKind::MsgAck, Confirmation::ok(42));
    h.confirm(MessageKind::MsgAck, Confirmation::failed(42, "?"));
    assert!(h.reports().is_empty());
    assert_eq!(h.dispatcher.packets().size(), 0);
}

#[tokio::test]
async fn test_invalid_command_is_dropped() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 5 open now 10").await;
    h.command("DBGK valve-ctrl alias_udp_valve 0 open now").await;
    assert!(h.sent.try_recv().is_err());
    assert_eq!(h.dispatcher.armed_count(), 0);
    assert!(h.reports().is_empty());
}

#[tokio::test]
async fn test_now_with_latency_waits_for_the_sweeper() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 0 open now 10").await;
    assert!(h.sent.try_recv().is_err());
    assert_eq!(h.dispatcher.armed_count(), 1);
    assert!(h.journal.is_empty(), "now commands are not journaled");

    h.clock.advance(TimeDelta::seconds(5));
    h.dispatcher.sweep();
    h.drain().await;
    assert!(h.sent.try_recv().is_err());

    h.clock.advance(TimeDelta::seconds(5));
    h.dispatcher.sweep();
    h.drain().await;
    let (_, envelope) = h.next_sent();
    assert_eq!(envelope.kind(), MessageKind::MsgValveControl);
    assert_eq!(h.dispatcher.armed_count(), 0);
}

#[tokio::test]
async fn test_period_fires_weekly_and_stays_journaled() {
    // Monday morning
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 1 close period 2 13:45:00").await;

    assert!(h.sent.try_recv().is_err());
    assert_eq!(h.dispatcher.armed_count(), 1);
    assert_eq!(
        h.journal.lines(),
        vec!["DBGK valve-ctrl alias_udp_valve 1 close period 2 13:45:00".to_string()]
    );

    h.clock.set(at("2026-10-20 13:45:00"));
    h.dispatcher.sweep();
    h.drain().await;
    let (_, envelope) = h.next_sent();
    match envelope.payload {
        Some(envelope::Payload::ValveControl(vc)) => {
            assert_eq!(vc.valve_index, 1);
            assert!(!vc.open);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // Same occurrence, next tick: no duplicate
    h.clock.advance(TimeDelta::seconds(1));
    h.dispatcher.sweep();
    h.drain().await;
    assert!(h.sent.try_recv().is_err());

    assert_eq!(h.dispatcher.armed_count(), 1);
    assert_eq!(h.journal.len(), 1);
}

#[tokio::test]
async fn test_event_fires_once_and_leaves_the_journal() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 3 open event 2026-11-01 06:30:00").await;
    assert_eq!(h.journal.len(), 1);

    h.clock.set(at("2026-11-01 06:30:00"));
    h.dispatcher.sweep();
    h.drain().await;

    h.next_sent();
    assert_eq!(h.dispatcher.armed_count(), 0);
    assert!(h.journal.is_empty());
}

#[tokio::test]
async fn test_past_event_is_reported_missed() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 3 open event 2026-10-01 06:30:00").await;

    assert!(h.sent.try_recv().is_err());
    assert_eq!(h.dispatcher.armed_count(), 0);
    assert!(h.journal.is_empty());
    assert_eq!(
        h.reports(),
        vec![DeliveryReport::ScheduleMissed {
            command: "DBGK valve-ctrl alias_udp_valve 3 open event 2026-10-01 06:30:00".into(),
            at: at("2026-10-01 06:30:00"),
        }]
    );
}

#[tokio::test]
async fn test_time_sync() {
    let mut h = Harness::new();
    h.command("UCMD time-sync 2026-10-20 07:00:00").await;
    assert_eq!(h.clock.now(), at("2026-10-20 07:00:00"));
    assert_eq!(
        h.reports(),
        vec![DeliveryReport::TimeSynced { at: at("2026-10-20 07:00:00") }]
    );
    assert!(h.sent.try_recv().is_err());

    let mut h = Harness::with(
        ManualClock::unprivileged(at("2026-10-19 09:00:00")),
        Arc::new(MemoryJournal::new()),
    );
    h.command("UCMD time-sync 2026-10-20 07:00:00").await;
    assert_eq!(h.clock.now(), at("2026-10-19 09:00:00"));
    assert!(h.reports().is_empty());
}

#[tokio::test]
async fn test_reload_rearms_journaled_commands() {
    let journal = Arc::new(MemoryJournal::new());
    let period = command::parse(b"DBGK valve-ctrl alias_udp_valve 1 close period 2 13:45:00", "console").unwrap();
    let past = command::parse(b"DBGK valve-ctrl alias_udp_valve 0 open event 2026-10-01 06:30:00", "console").unwrap();
    journal.persist(&period).unwrap();
    journal.persist(&past).unwrap();

    let mut h = Harness::with(ManualClock::new(at("2026-10-19 09:00:00")), journal);
    assert_eq!(h.dispatcher.reload_journal().unwrap(), 2);
    assert_eq!(h.dispatcher.armed_count(), 2);

    // The stale event is reported and leaves the journal on the first sweep
    h.dispatcher.sweep();
    assert_eq!(h.dispatcher.armed_count(), 1);
    assert_eq!(h.journal.lines(), vec![period.to_string()]);
    assert!(matches!(&h.reports()[..], [DeliveryReport::ScheduleMissed { .. }]));
}

#[tokio::test]
async fn test_insert_reloaded_cmd_only_takes_persistent_valve_commands() {
    let h = Harness::new();
    let parse = |line: &str| command::parse(line.as_bytes(), "console").unwrap();

    assert!(h
        .dispatcher
        .insert_reloaded_cmd(parse("DBGK valve-ctrl alias_udp_valve 1 close period 2 13:45:00")));
    assert!(!h
        .dispatcher
        .insert_reloaded_cmd(parse("DBGK valve-ctrl alias_udp_valve 1 close now 5")));
    assert!(!h.dispatcher.insert_reloaded_cmd(parse("DBGK state alias_udp_valve")));
    assert!(!h
        .dispatcher
        .insert_reloaded_cmd(parse("UCMD time-sync 2026-10-20 07:00:00")));

    assert_eq!(h.dispatcher.armed_count(), 1);
    assert!(h.journal.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_peer_liveness_transitions_reported_once() {
    let mut h = Harness::new();
    let heartbeat = codec::encode(&Envelope::heartbeat("alias_udp_valve")).unwrap();
    let received = || TransportEvent::Received {
        sender: "alias_udp_valve".into(),
        payload: heartbeat.clone(),
    };

    h.dispatcher.on_transport_event(received());
    h.dispatcher.on_transport_event(received());
    assert_eq!(
        h.reports(),
        vec![DeliveryReport::ServiceUp { peer: "alias_udp_valve".into() }]
    );

    tokio::time::advance(Duration::from_secs(10)).await;
    h.dispatcher.sweep();
    assert!(h.reports().is_empty());

    tokio::time::advance(Duration::from_secs(6)).await;
    h.dispatcher.sweep();
    tokio::time::advance(Duration::from_secs(20)).await;
    h.dispatcher.sweep();
    assert_eq!(
        h.reports(),
        vec![DeliveryReport::ServiceDown {
            peer: "alias_udp_valve".into(),
            reason: ServiceFault::Silent,
        }]
    );

    h.dispatcher.on_transport_event(received());
    h.dispatcher.on_transport_event(TransportEvent::ConnectionChanged {
        peer: "alias_udp_valve".into(),
        connected: false,
    });
    assert_eq!(
        h.reports(),
        vec![
            DeliveryReport::ServiceUp { peer: "alias_udp_valve".into() },
            DeliveryReport::ServiceDown {
                peer: "alias_udp_valve".into(),
                reason: ServiceFault::Disconnected,
            },
        ]
    );
}

#[tokio::test]
async fn test_rx_classifies_datagrams() {
    let h = Harness::new();
    let received = |payload: Bytes| TransportEvent::Received {
        sender: "alias_udp_valve".into(),
        payload,
    };

    h.dispatcher
        .on_transport_event(received(Bytes::from_static(b"DBGK state alias_udp_valve")));
    h.dispatcher
        .on_transport_event(received(Bytes::from_static(b"\x00garbage")));
    let ack = Envelope::confirmation("alias_udp_valve", MessageKind::MsgAck, Confirmation::ok(7));
    h.dispatcher.on_transport_event(received(codec::encode(&ack).unwrap()));

    assert_eq!(
        h.dispatcher.queue.try_pop(),
        Some(Work::Command {
            sender: "alias_udp_valve".into(),
            text: Bytes::from_static(b"DBGK state alias_udp_valve"),
        })
    );
    assert_eq!(
        h.dispatcher.queue.try_pop(),
        Some(Work::Confirmation {
            sender: "alias_udp_valve".into(),
            kind: MessageKind::MsgAck,
            confirmation: Confirmation::ok(7),
        })
    );
    assert_eq!(h.dispatcher.queue.try_pop(), None);
    // Only the confirmation counted as a sign of life
    assert_eq!(h.dispatcher.services().size(), 1);
}

#[tokio::test]
async fn test_due_event_waits_for_room_in_the_queue() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 2 open event 2026-10-19 10:00:00").await;
    assert_eq!(h.dispatcher.armed_count(), 1);
    assert_eq!(h.journal.len(), 1);

    h.fill_queue();
    h.clock.set(at("2026-10-19 10:00:00"));
    h.dispatcher.sweep();

    // Still armed and journaled, nothing lost
    assert_eq!(h.dispatcher.armed_count(), 1);
    assert_eq!(h.journal.len(), 1);
    assert!(h.reports().is_empty());

    h.clear_queue();
    h.clock.advance(TimeDelta::seconds(1));
    h.dispatcher.sweep();
    assert_eq!(h.dispatcher.armed_count(), 0);
    assert!(h.journal.is_empty());

    h.drain().await;
    let (_, envelope) = h.next_sent();
    assert_eq!(envelope.kind(), MessageKind::MsgValveControl);
}

#[tokio::test]
async fn test_event_stuck_behind_a_full_queue_is_reported_missed() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 2 open event 2026-10-19 10:00:00").await;

    h.fill_queue();
    h.clock.set(at("2026-10-19 10:00:00"));
    h.dispatcher.sweep();
    h.clock.advance(TimeDelta::seconds(5));
    h.dispatcher.sweep();

    assert_eq!(h.dispatcher.armed_count(), 0);
    assert!(h.journal.is_empty());
    assert_eq!(
        h.reports(),
        vec![DeliveryReport::ScheduleMissed {
            command: "DBGK valve-ctrl alias_udp_valve 2 open event 2026-10-19 10:00:00".into(),
            at: at("2026-10-19 10:00:00"),
        }]
    );
}

#[tokio::test]
async fn test_period_occurrence_lost_to_a_full_queue_is_reported() {
    let mut h = Harness::new();
    h.command("DBGK valve-ctrl alias_udp_valve 1 close period 2 13:45:00").await;

    h.fill_queue();
    h.clock.set(at("2026-10-20 13:45:00"));
    h.dispatcher.sweep();

    assert!(matches!(
        &h.reports()[..],
        [DeliveryReport::ScheduleMissed { at: missed, .. }] if *missed == at("2026-10-20 13:45:00")
    ));
    assert_eq!(h.dispatcher.armed_count(), 1);
    assert_eq!(h.journal.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resend_blocked_by_a_full_queue_is_not_counted() {
    let mut h = Harness::new();
    h.command("DBGK state alias_udp_valve").await;
    let (_, envelope) = h.next_sent();
    let id = msg_id(&envelope);

    h.fill_queue();
    tokio::time::advance(Duration::from_secs(4)).await;
    h.dispatcher.sweep();
    assert_eq!(h.dispatcher.packets().flags(&id).unwrap().retransmits(), 0);
    assert_eq!(h.dispatcher.packets().delivery_state(id).unwrap(), DeliveryState::Sent);

    h.clear_queue();
    tokio::time::advance(Duration::from_secs(4)).await;
    h.dispatcher.sweep();
    assert_eq!(
        h.dispatcher.packets().delivery_state(id).unwrap(),
        DeliveryState::Retrying { attempt: 1 }
    );
    h.drain().await;
    let (_, resent) = h.next_sent();
    assert_eq!(msg_id(&resent), id);
}

#[tokio::test]
async fn test_garbage_and_console_senders_leave_no_peer_records() {
    let mut h = Harness::new();
    for port in 0..100u16 {
        h.dispatcher.on_transport_event(TransportEvent::Received {
            sender: format!("10.9.9.9:{}", 40000 + port),
            payload: Bytes::from_static(b"\x00garbage"),
        });
    }
    h.dispatcher.on_transport_event(TransportEvent::Received {
        sender: "10.9.9.10:51234".into(),
        payload: Bytes::from_static(b"DBGK state alias_udp_valve"),
    });

    assert_eq!(h.dispatcher.services().size(), 0);
    assert!(h.reports().is_empty());
    assert_eq!(h.dispatcher.queue.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_peer_is_forgotten_after_retention() {
    let mut h = Harness::new();
    let heartbeat = codec::encode(&Envelope::heartbeat("alias_udp_valve")).unwrap();
    h.dispatcher.on_transport_event(TransportEvent::Received {
        sender: "alias_udp_valve".into(),
        payload: heartbeat,
    });

    tokio::time::advance(Duration::from_secs(16)).await;
    h.dispatcher.sweep();
    assert_eq!(h.reports().len(), 2);
    assert_eq!(h.dispatcher.services().size(), 1);

    tokio::time::advance(Duration::from_secs(200)).await;
    h.dispatcher.sweep();
    assert_eq!(h.dispatcher.services().size(), 1);

    tokio::time::advance(Duration::from_secs(101)).await;
    h.dispatcher.sweep();
    assert_eq!(h.dispatcher.services().size(), 0);
    assert!(h.reports().is_empty());
}
