//! Delayed-ACK flushing, retransmission, routing failures and the worker.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::*;
use net::tcp::{TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_SYN};
use net::{
    ArpOp, DropReason, EthAddr, Ipv4Addr, Ipv4Proto, NetStats, NetworkTask, ProcessResult,
    SocketError, StackConfig, TcpConnectError, TcpState, TxError,
};

const PEER_ISN: u32 = 9000;

fn deliver_data(h: &Harness, seq: u32, payload: &[u8]) {
    let frame = TcpFrame::new(80, 50000)
        .flags(TCP_FLAG_PSH | TCP_FLAG_ACK)
        .seq(seq)
        .ack(1001)
        .payload(payload)
        .build();
    h.deliver(&frame);
}

// ============================================================================
// Idle Housekeeping
// ============================================================================

#[test]
fn test_housekeeping_on_empty_registries_is_noop() {
    let h = Harness::new();
    h.stack.flush_delayed_acks();
    h.stack.retransmit_pass();
    h.stack.flush_delayed_acks();

    assert!(h.sent().is_empty());
    let stats = h.stack.stats();
    assert_eq!(NetStats::get(&stats.delayed_acks_flushed), 0);
    assert_eq!(NetStats::get(&stats.retransmit_passes), 0);
    assert_eq!(NetStats::get(&stats.segments_retransmitted), 0);
    assert!(h.stack.delayed_acks().is_empty());
    assert!(h.stack.retransmits().is_empty());
}

#[test]
fn test_housekeeping_leaves_idle_connection_alone() {
    let h = Harness::new();
    let socket = h.established(50000, 80, PEER_ISN);
    let before = (socket.lock().sequence_number, socket.lock().ack_number);

    h.clock.set(60_000);
    h.stack.flush_delayed_acks();
    h.stack.retransmit_pass();

    assert!(h.sent().is_empty());
    assert_eq!(socket.state(), TcpState::Established);
    assert_eq!((socket.lock().sequence_number, socket.lock().ack_number), before);
}

// ============================================================================
// Delayed ACK
// ============================================================================

#[test]
fn test_delayed_ack_flushed_after_max_delay() {
    let h = Harness::new();
    let socket = h.established(50000, 80, PEER_ISN);

    deliver_data(&h, PEER_ISN + 1, b"hello");
    assert!(h.stack.delayed_acks().contains(socket.id()));

    // Too early: stays parked
    h.clock.set(100);
    h.stack.flush_delayed_acks();
    assert!(h.sent().is_empty());
    assert!(h.stack.delayed_acks().contains(socket.id()));

    h.clock.set(500);
    h.stack.flush_delayed_acks();
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let (ack, _) = parse_sent_tcp(&sent[0]);
    assert_eq!(ack.flags, TCP_FLAG_ACK);
    assert_eq!(ack.ack_num, PEER_ISN + 6);
    assert!(h.stack.delayed_acks().is_empty());
    assert_eq!(NetStats::get(&h.stack.stats().delayed_acks_flushed), 1);

    let ctl = socket.lock();
    assert_eq!(ctl.last_ack_number_sent, PEER_ISN + 6);
    assert_eq!(ctl.last_ack_sent_ms, 500);
}

#[test]
fn test_delayed_acks_coalesce() {
    let h = Harness::new();
    let socket = h.established(50000, 80, PEER_ISN);

    deliver_data(&h, PEER_ISN + 1, b"one");
    deliver_data(&h, PEER_ISN + 4, b"two");
    assert!(h.sent().is_empty());
    assert_eq!(h.stack.delayed_acks().len(), 1);

    h.clock.set(600);
    h.stack.flush_delayed_acks();
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(parse_sent_tcp(&sent[0]).0.ack_num, PEER_ISN + 7);
    assert_eq!(socket.lock().received_len(), 6);
}

// ============================================================================
// Retransmission
// ============================================================================

#[test]
fn test_syn_retransmit_backoff_and_timeout() {
    let h = Harness::new();
    let socket = h.stack.tcp_connect(LOCAL_IP, 50000, PEER_IP, 80).unwrap();
    h.sent();

    let pass_at = |ms: u64| {
        h.clock.set(ms);
        h.stack.retransmit_pass();
        h.sent()
    };

    assert!(pass_at(999).is_empty());

    let resent = pass_at(1000);
    assert_eq!(resent.len(), 1);
    let (syn, _) = parse_sent_tcp(&resent[0]);
    assert_eq!(syn.flags, TCP_FLAG_SYN);
    assert_eq!(syn.seq_num, 1000);
    assert_eq!(socket.lock().retransmit_attempts(), 1);

    assert!(pass_at(2999).is_empty());
    assert_eq!(pass_at(3000).len(), 1);
    assert!(pass_at(6999).is_empty());
    assert_eq!(pass_at(7000).len(), 1);
    assert_eq!(socket.lock().retransmit_attempts(), 3);

    assert!(pass_at(14_999).is_empty());
    assert!(pass_at(15_000).is_empty());

    let ctl = socket.lock();
    assert_eq!(ctl.state, TcpState::Closed);
    assert_eq!(ctl.error, Some(TcpConnectError::RetransmitTimeout));
    assert_eq!(ctl.unacked_len(), 0);
    drop(ctl);
    assert!(!h.stack.retransmits().contains(socket.id()));
    assert_eq!(NetStats::get(&h.stack.stats().segments_retransmitted), 3);
}

#[test]
fn test_ack_clears_retransmit_queue() {
    let h = Harness::new();
    let socket = h.established(50000, 80, PEER_ISN);

    socket.send(&h.stack, b"request").unwrap();
    h.sent();
    assert!(h.stack.retransmits().contains(socket.id()));

    // Partial ack does not cover the segment
    let partial = TcpFrame::new(80, 50000)
        .flags(TCP_FLAG_ACK)
        .seq(PEER_ISN + 1)
        .ack(1004)
        .build();
    h.deliver(&partial);
    assert_eq!(socket.lock().unacked_len(), 1);

    let full = TcpFrame::new(80, 50000)
        .flags(TCP_FLAG_ACK)
        .seq(PEER_ISN + 1)
        .ack(1008)
        .build();
    h.deliver(&full);
    assert_eq!(socket.lock().unacked_len(), 0);
    assert_eq!(socket.lock().retransmit_attempts(), 0);
    assert!(!h.stack.retransmits().contains(socket.id()));

    h.clock.set(10_000);
    h.stack.retransmit_pass();
    assert!(h.sent().is_empty());
}

#[test]
fn test_retransmit_resends_every_unacked_segment() {
    let h = Harness::new();
    let socket = h.established(50000, 80, PEER_ISN);

    socket.send(&h.stack, b"first").unwrap();
    socket.send(&h.stack, b"second").unwrap();
    h.sent();

    h.clock.set(1000);
    h.stack.retransmit_pass();
    let resent = h.sent();
    assert_eq!(resent.len(), 2);
    assert_eq!(parse_sent_tcp(&resent[0]).1, b"first");
    assert_eq!(parse_sent_tcp(&resent[1]).1, b"second");
    assert_eq!(NetStats::get(&h.stack.stats().retransmit_passes), 1);
}

#[test]
fn test_time_wait_expires_and_frees_tuple() {
    let h = Harness::new();
    let socket = h.established(50000, 80, PEER_ISN);
    socket.close(&h.stack).unwrap();
    h.deliver(
        &TcpFrame::new(80, 50000)
            .flags(TCP_FLAG_FIN | TCP_FLAG_ACK)
            .seq(PEER_ISN + 1)
            .ack(1002)
            .build(),
    );
    h.sent();
    assert_eq!(socket.state(), TcpState::TimeWait);
    assert_eq!(socket.close(&h.stack), Err(SocketError::InvalidState));

    let linger = StackConfig::default().time_wait_timeout.as_millis() as u64;
    h.clock.set(linger - 1);
    h.stack.retransmit_pass();
    assert_eq!(socket.state(), TcpState::TimeWait);
    assert_eq!(h.stack.sockets().tcp_count(), 1);

    h.clock.set(linger);
    h.stack.retransmit_pass();
    assert!(h.sent().is_empty());
    assert_eq!(socket.state(), TcpState::Closed);
    assert_eq!(h.stack.sockets().tcp_count(), 0);
    assert!(!h.stack.retransmits().contains(socket.id()));
    assert_eq!(socket.close(&h.stack), Ok(()));

    // Same local port is free again
    let again = h.stack.tcp_connect(LOCAL_IP, 50000, PEER_IP, 80).unwrap();
    assert_ne!(again.id(), socket.id());
    assert_eq!(parse_sent_tcp(&h.sent()[0]).0.flags, TCP_FLAG_SYN);
}

#[test]
fn test_unanswered_syn_ack_reclaims_child() {
    let h = Harness::new();
    let listener = h.stack.tcp_listen(LOCAL_IP, 80, 4).unwrap();
    h.deliver(&TcpFrame::new(50000, 80).flags(TCP_FLAG_SYN).seq(PEER_ISN).build());
    h.sent();
    assert_eq!(listener.pending_children(), 1);

    for ms in [1000, 3000, 7000, 15_000] {
        h.clock.set(ms);
        h.stack.retransmit_pass();
    }
    assert_eq!(h.sent().len(), 3);
    assert_eq!(listener.pending_children(), 0);
    assert_eq!(h.stack.sockets().tcp_count(), 1);
    assert!(h.stack.retransmits().is_empty());
}

// ============================================================================
// Routing Failures
// ============================================================================

#[test]
fn test_connect_arp_miss_broadcasts_request() {
    let h = Harness::new();
    let unknown = Ipv4Addr::new(192, 168, 1, 30);

    let result = h.stack.tcp_connect(LOCAL_IP, 50000, unknown, 80);
    assert_eq!(result.err(), Some(SocketError::Tx(TxError::NoRoute)));

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let (eth, request) = parse_sent_arp(&sent[0]);
    assert_eq!(eth.dst, EthAddr::BROADCAST);
    assert_eq!(request.op, ArpOp::Request);
    assert_eq!(request.sender_ip, LOCAL_IP);
    assert_eq!(request.target_ip, unknown);

    assert_eq!(h.stack.sockets().tcp_count(), 0);
    assert!(h.stack.retransmits().is_empty());
}

#[test]
fn test_off_link_without_gateway_has_no_route() {
    let h = Harness::new();
    let result = h.stack.tcp_connect(LOCAL_IP, 50000, Ipv4Addr::new(8, 8, 8, 8), 53);
    assert_eq!(result.err(), Some(SocketError::Tx(TxError::NoRoute)));
    assert!(h.sent().is_empty());
}

#[test]
fn test_link_down_has_no_route() {
    let h = Harness::new();
    h.adapter.set_link_up(false);
    let result = h.stack.tcp_connect(LOCAL_IP, 50000, PEER_IP, 80);
    assert_eq!(result.err(), Some(SocketError::Tx(TxError::NoRoute)));
    assert!(h.sent().is_empty());
}

#[test]
fn test_reply_without_buffer_is_dropped() {
    let h = Harness::new();
    h.adapter.set_buffers_available(false);
    let frame = ipv4_frame(PEER_IP, LOCAL_IP, Ipv4Proto::Icmp, &icmp_echo_request(1, 1, b"x"));
    assert_eq!(h.deliver(&frame), ProcessResult::Dropped(DropReason::NoBuffer));
    assert!(h.sent().is_empty());
}

// ============================================================================
// Worker
// ============================================================================

fn quick_config() -> StackConfig {
    StackConfig {
        idle_timeout: Duration::from_millis(10),
        ..StackConfig::default()
    }
}

#[test]
fn test_run_until_idle_drains_adapters() {
    let h = Harness::with_config(quick_config());
    let frame = ipv4_frame(PEER_IP, LOCAL_IP, Ipv4Proto::Icmp, &icmp_echo_request(1, 1, b"a"));
    for _ in 0..3 {
        assert!(h.adapter.inject(&frame, 0));
        h.stack.notify_frame_received();
    }

    assert_eq!(h.stack.run_until_idle(), 3);
    assert_eq!(h.sent().len(), 3);
    assert_eq!(h.stack.pending_frames(), 0);
    assert_eq!(h.adapter.rx_queue_len(), 0);
}

#[test]
fn test_worker_answers_injected_echo() {
    let h = Harness::with_config(quick_config());
    let mut task = NetworkTask::spawn(h.stack.clone()).unwrap();

    let frame = ipv4_frame(PEER_IP, LOCAL_IP, Ipv4Proto::Icmp, &icmp_echo_request(2, 9, b"worker"));
    assert!(h.adapter.inject(&frame, 0));
    h.stack.notify_frame_received();

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.adapter.transmitted_count() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    task.shutdown();
    assert!(task.is_finished());

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let (_, ip, reply) = parse_sent_ipv4(&sent[0]);
    assert_eq!(ip.dst, PEER_IP);
    assert_eq!(reply[0], 0);
    assert_eq!(&reply[8..], b"worker");
}

#[test]
fn test_worker_flushes_delayed_ack_while_idle() {
    let h = Harness::with_config(quick_config());
    let socket = h.established(50000, 80, PEER_ISN);
    deliver_data(&h, PEER_ISN + 1, b"idle");
    assert!(h.stack.delayed_acks().contains(socket.id()));

    h.clock.set(1_000);
    let task = NetworkTask::spawn(h.stack.clone()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !h.stack.delayed_acks().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    drop(task);

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(parse_sent_tcp(&sent[0]).0.ack_num, PEER_ISN + 5);
}
