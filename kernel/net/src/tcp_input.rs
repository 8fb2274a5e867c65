//! Inbound TCP segment processing.
//!
//! [`handle_tcp`] validates a segment, finds its connection by four-tuple
//! and runs the connection state machine under the connection's lock:
//!
//! ```text
//!                         +--------+  SYN / child SYN+ACK
//!                         | Listen |-----------------------> child SynReceived
//!                         +--------+
//!   connect: SYN   +---------+  SYN+ACK / ACK   +-------------+
//!   -------------> | SynSent |----------------->| Established |<--+
//!                  +---------+                  +-------------+   |
//!                       | SYN / SYN+ACK          |  |  FIN         | ACK
//!                       v                        |  v              |
//!                  +-------------+   close: FIN  | CloseWait    SynReceived
//!                  | SynReceived |               |  | close: FIN
//!                  +-------------+               v  v
//!                                          FinWait1  LastAck --ACK--> Closed
//!                                   ACK  /    | FIN      \ FIN+ACK
//!                                 FinWait2   Closing      \
//!                                   | FIN      | ACK        \
//!                                   +--------> TimeWait <----+
//! ```
//!
//! Segments for unknown tuples are answered with RST+ACK unless they carry
//! RST themselves. An inbound RST is never answered with another RST.
//!
//! `TimeWait` is left after `time_wait_timeout` by the retransmit pass. A
//! connection that ends up `Closed` with no owner is reclaimed from the
//! socket table before the lock is released.

use alloc::sync::Arc;

use crate::delayed_ack::send_delayed_tcp_ack;
use crate::ipv4::{Ipv4Header, Ipv4Proto};
use crate::route::route_to;
use crate::socket::{Direction, TcpConnectError, TcpControl, TcpSocket};
use crate::stack::{DropReason, NetworkStack, ProcessResult};
use crate::tcp::{
    build_tcp_segment, parse_tcp_header, parse_window_scale, verify_tcp_checksum, TcpConnKey,
    TcpError, TcpHeader, TcpSegmentKind, TcpState, TCP_FLAG_ACK, TCP_FLAG_RST, TCP_FLAG_SYN,
};

/// Process one TCP segment addressed to this host.
pub fn handle_tcp(
    stack: &NetworkStack,
    ip: &Ipv4Header,
    segment: &[u8],
    timestamp_ms: u64,
) -> ProcessResult {
    let header = match parse_tcp_header(segment) {
        Ok(h) => h,
        Err(e) => {
            stack.stats().inc_malformed();
            klog!(Debug, "tcp: dropping segment from {}: {}", ip.src, e);
            return ProcessResult::Dropped(DropReason::Tcp(e));
        }
    };
    if !verify_tcp_checksum(ip.src, ip.dst, segment) {
        stack.stats().inc_malformed();
        klog!(Debug, "tcp: bad checksum from {}:{}", ip.src, header.src_port);
        return ProcessResult::Dropped(DropReason::Tcp(TcpError::BadChecksum));
    }
    stack.stats().inc_tcp_rx();

    let payload = &segment[header.header_len()..];
    let key = TcpConnKey::new(ip.dst, header.dst_port, ip.src, header.src_port);

    let Some(socket) = stack.sockets().lookup_tcp(&key) else {
        if header.is_rst() {
            return ProcessResult::Dropped(DropReason::NoSocket);
        }
        klog!(Debug, "tcp: no socket for {}, sending RST", key);
        return send_reset_for_unknown(stack, &key, &header);
    };

    let mut ctl = socket.lock();
    ctl.packets_in += 1;
    ctl.bytes_in += payload.len() as u64;
    if header.is_ack() {
        socket.receive_ack(&mut ctl, stack, header.ack_num);
    }

    klog!(
        Trace,
        "tcp: {} rx {:?} in {:?} seq={} ack={} len={}",
        key,
        header.kind(),
        ctl.state,
        header.seq_num,
        header.ack_num,
        payload.len()
    );

    let segment = Segment {
        header: &header,
        raw: segment,
        payload,
        timestamp_ms,
    };
    let state = ctl.state;
    let result = match state {
        TcpState::Closed => on_closed(stack, &socket, &mut ctl, &segment),
        TcpState::TimeWait => {
            reset_and_close(stack, &socket, &mut ctl, &segment);
            ProcessResult::Handled
        }
        TcpState::Listen => on_listen(stack, &socket, key, &segment),
        TcpState::SynSent => on_syn_sent(stack, &socket, &mut ctl, &segment),
        TcpState::SynReceived => on_syn_received(stack, &socket, &mut ctl, &segment),
        TcpState::CloseWait => {
            reset_and_close(stack, &socket, &mut ctl, &segment);
            ProcessResult::Handled
        }
        TcpState::LastAck => on_last_ack(stack, &socket, &mut ctl, &segment),
        TcpState::FinWait1 => on_fin_wait1(stack, &socket, &mut ctl, &segment),
        TcpState::FinWait2 => on_fin_wait2(stack, &socket, &mut ctl, &segment),
        TcpState::Closing => on_closing(stack, &socket, &mut ctl, &segment),
        TcpState::Established => on_established(stack, &socket, &mut ctl, &segment),
    };

    if state != TcpState::TimeWait && ctl.state == TcpState::TimeWait {
        // Linger is timed by the retransmit pass
        stack.retransmits().register(&socket);
    }
    socket.reclaim_if_unowned(&ctl, stack);
    result
}

/// A validated inbound segment.
struct Segment<'a> {
    header: &'a TcpHeader,
    /// Whole segment, options included
    raw: &'a [u8],
    payload: &'a [u8],
    timestamp_ms: u64,
}

impl Segment<'_> {
    fn kind(&self) -> TcpSegmentKind {
        self.header.kind()
    }

    /// Peer sequence number advanced by `extra` past the payload.
    fn ack_past_payload(&self, extra: u32) -> u32 {
        self.header
            .seq_num
            .wrapping_add(self.payload.len() as u32)
            .wrapping_add(extra)
    }

    fn window_scale(&self) -> Option<u8> {
        parse_window_scale(self.raw, self.header)
    }
}

// ============================================================================
// Replies
// ============================================================================

fn reply(stack: &NetworkStack, socket: &Arc<TcpSocket>, ctl: &mut TcpControl, flags: u8) {
    if let Err(e) = socket.send_tcp_packet(ctl, stack, flags, &[]) {
        klog!(Debug, "tcp: {} reply {:#04x} failed: {}", socket.key(), flags, e);
    }
}

fn send_ack_now(stack: &NetworkStack, socket: &Arc<TcpSocket>, ctl: &mut TcpControl) {
    if let Err(e) = socket.send_ack(ctl, stack, false) {
        klog!(Debug, "tcp: {} ack failed: {}", socket.key(), e);
    }
}

fn reset_and_close(
    stack: &NetworkStack,
    socket: &Arc<TcpSocket>,
    ctl: &mut TcpControl,
    seg: &Segment<'_>,
) {
    if !seg.header.is_rst() {
        reply(stack, socket, ctl, TCP_FLAG_RST);
    }
    ctl.set_state(TcpState::Closed);
}

/// Answer a segment for a tuple with no connection: RST+ACK, seq 0,
/// ack = peer seq + 1.
fn send_reset_for_unknown(stack: &NetworkStack, key: &TcpConnKey, header: &TcpHeader) -> ProcessResult {
    let rst = TcpHeader::new(
        key.local_port,
        key.remote_port,
        0,
        header.seq_num.wrapping_add(1),
        TCP_FLAG_RST | TCP_FLAG_ACK,
        0,
    );
    let segment = build_tcp_segment(key.local_ip, key.remote_ip, &rst, &[], &[]);

    let Some(route) = route_to(stack, key.remote_ip, key.local_ip) else {
        return ProcessResult::Dropped(DropReason::NoRoute);
    };
    match route.send_ipv4(
        key.local_ip,
        key.remote_ip,
        Ipv4Proto::Tcp,
        stack.config().default_ttl,
        &segment,
    ) {
        Ok(()) => {
            stack.stats().inc_resets_tx();
            ProcessResult::Replied
        }
        Err(e) => {
            klog!(Debug, "tcp: RST to {} failed: {}", key, e);
            ProcessResult::Dropped(DropReason::NoBuffer)
        }
    }
}

// ============================================================================
// Per-State Handlers
// ============================================================================

fn on_closed(
    stack: &NetworkStack,
    socket: &Arc<TcpSocket>,
    ctl: &mut TcpControl,
    seg: &Segment<'_>,
) -> ProcessResult {
    if seg.header.is_rst() {
        return ProcessResult::Handled;
    }
    klog!(Debug, "tcp: {} segment for closed connection, resetting", socket.key());
    ctl.ack_number = seg.ack_past_payload(1);
    reply(stack, socket, ctl, TCP_FLAG_RST | TCP_FLAG_ACK);
    ProcessResult::Replied
}

/// Passive open. The listener itself never changes state.
fn on_listen(
    stack: &NetworkStack,
    listener: &Arc<TcpSocket>,
    key: TcpConnKey,
    seg: &Segment<'_>,
) -> ProcessResult {
    if seg.kind() != TcpSegmentKind::Syn {
        klog!(
            Debug,
            "tcp: listener {} ignoring {:?}",
            listener.key(),
            seg.kind()
        );
        return ProcessResult::Handled;
    }

    let child = match listener.try_create_client(stack, key) {
        Ok(child) => child,
        Err(e) => {
            klog!(Warn, "tcp: listener {} dropping SYN from {}: {}", listener.key(), key, e);
            return ProcessResult::Dropped(DropReason::Rejected);
        }
    };

    let mut child_ctl = child.lock();
    child_ctl.sequence_number = stack.config().initial_sequence_number;
    child_ctl.ack_number = seg.header.seq_num.wrapping_add(1);
    if let Some(scale) = seg.window_scale() {
        child_ctl.send_window_scale = scale;
    }
    reply(stack, &child, &mut child_ctl, TCP_FLAG_SYN | TCP_FLAG_ACK);
    child_ctl.set_state(TcpState::SynReceived);
    klog!(Debug, "tcp: {} passive open", key);
    ProcessResult::Replied
}

fn on_syn_sent(
    stack: &NetworkStack,
    socket: &Arc<TcpSocket>,
    ctl: &mut TcpControl,
    seg: &Segment<'_>,
) -> ProcessResult {
    match seg.kind() {
        TcpSegmentKind::Syn => {
            // Simultaneous open
            ctl.ack_number = seg.ack_past_payload(1);
            if let Some(scale) = seg.window_scale() {
                ctl.send_window_scale = scale;
            }
            reply(stack, socket, ctl, TCP_FLAG_SYN | TCP_FLAG_ACK);
            ctl.set_state(TcpState::SynReceived);
        }
        TcpSegmentKind::SynAck => {
            ctl.ack_number = seg.ack_past_payload(1);
            if let Some(scale) = seg.window_scale() {
                ctl.send_window_scale = scale;
            }
            send_ack_now(stack, socket, ctl);
            ctl.set_state(TcpState::Established);
            ctl.connected = true;
            klog!(Debug, "tcp: {} established", socket.key());
        }
        TcpSegmentKind::FinAck => {
            ctl.ack_number = seg.ack_past_payload(1);
            send_delayed_tcp_ack(stack, socket, ctl);
            ctl.error = Some(TcpConnectError::FinDuringConnect);
            ctl.set_state(TcpState::Closed);
        }
        TcpSegmentKind::RstAck => {
            ctl.error = Some(TcpConnectError::RstDuringConnect);
            ctl.set_state(TcpState::Closed);
        }
        _ => {
            reply(stack, socket, ctl, TCP_FLAG_RST);
            ctl.error = Some(TcpConnectError::UnexpectedFlagsDuringConnect);
            ctl.set_state(TcpState::Closed);
        }
    }
    ProcessResult::Handled
}

fn on_syn_received(
    stack: &NetworkStack,
    socket: &Arc<TcpSocket>,
    ctl: &mut TcpControl,
    seg: &Segment<'_>,
) -> ProcessResult {
    match seg.kind() {
        TcpSegmentKind::Ack => {
            ctl.ack_number = seg.ack_past_payload(0);
            match ctl.direction {
                Direction::Incoming => {
                    if !ctl.has_originator() {
                        klog!(Debug, "tcp: {} listener gone, resetting", socket.key());
                        reset_and_close(stack, socket, ctl, seg);
                        return ProcessResult::Handled;
                    }
                    ctl.set_state(TcpState::Established);
                    if !socket.release_to_originator(ctl) {
                        reset_and_close(stack, socket, ctl, seg);
                    }
                }
                Direction::Outgoing => {
                    ctl.set_state(TcpState::Established);
                    ctl.connected = true;
                }
                Direction::Passive | Direction::Unspecified => {
                    klog!(
                        Warn,
                        "tcp: {} ACK in SynReceived with direction {:?}",
                        socket.key(),
                        ctl.direction
                    );
                }
            }
        }
        TcpSegmentKind::Syn => {
            klog!(Debug, "tcp: {} ignoring repeated SYN", socket.key());
        }
        _ => reset_and_close(stack, socket, ctl, seg),
    }
    ProcessResult::Handled
}

fn on_last_ack(
    stack: &NetworkStack,
    socket: &Arc<TcpSocket>,
    ctl: &mut TcpControl,
    seg: &Segment<'_>,
) -> ProcessResult {
    if seg.kind() == TcpSegmentKind::Ack {
        ctl.ack_number = seg.ack_past_payload(0);
        ctl.set_state(TcpState::Closed);
    } else {
        reset_and_close(stack, socket, ctl, seg);
    }
    ProcessResult::Handled
}

fn on_fin_wait1(
    stack: &NetworkStack,
    socket: &Arc<TcpSocket>,
    ctl: &mut TcpControl,
    seg: &Segment<'_>,
) -> ProcessResult {
    match seg.kind() {
        TcpSegmentKind::Ack => {
            ctl.ack_number = seg.ack_past_payload(0);
            ctl.set_state(TcpState::FinWait2);
        }
        TcpSegmentKind::Fin => {
            ctl.ack_number = seg.ack_past_payload(1);
            send_ack_now(stack, socket, ctl);
            ctl.set_state(TcpState::Closing);
        }
        TcpSegmentKind::FinAck => {
            ctl.ack_number = seg.ack_past_payload(1);
            send_ack_now(stack, socket, ctl);
            ctl.enter_time_wait(stack.now_ms());
        }
        _ => reset_and_close(stack, socket, ctl, seg),
    }
    ProcessResult::Handled
}

fn on_fin_wait2(
    stack: &NetworkStack,
    socket: &Arc<TcpSocket>,
    ctl: &mut TcpControl,
    seg: &Segment<'_>,
) -> ProcessResult {
    match seg.kind() {
        TcpSegmentKind::Fin | TcpSegmentKind::FinAck => {
            ctl.ack_number = seg.ack_past_payload(1);
            send_ack_now(stack, socket, ctl);
            ctl.enter_time_wait(stack.now_ms());
        }
        TcpSegmentKind::RstAck => ctl.set_state(TcpState::Closed),
        TcpSegmentKind::Ack if !seg.payload.is_empty() => {
            // Half-closed peer data: ack advances by the payload only
            if ctl.did_receive(seg.payload, seg.timestamp_ms) {
                ctl.ack_number = seg.ack_past_payload(0);
                send_delayed_tcp_ack(stack, socket, ctl);
            }
        }
        _ => reset_and_close(stack, socket, ctl, seg),
    }
    ProcessResult::Handled
}

fn on_closing(
    stack: &NetworkStack,
    socket: &Arc<TcpSocket>,
    ctl: &mut TcpControl,
    seg: &Segment<'_>,
) -> ProcessResult {
    if seg.kind() == TcpSegmentKind::Ack {
        ctl.ack_number = seg.ack_past_payload(0);
        ctl.enter_time_wait(stack.now_ms());
    } else {
        reset_and_close(stack, socket, ctl, seg);
    }
    ProcessResult::Handled
}

fn on_established(
    stack: &NetworkStack,
    socket: &Arc<TcpSocket>,
    ctl: &mut TcpControl,
    seg: &Segment<'_>,
) -> ProcessResult {
    if seg.header.is_rst() {
        klog!(Debug, "tcp: {} reset by peer", socket.key());
        ctl.set_state(TcpState::Closed);
        return ProcessResult::Handled;
    }

    if seg.header.seq_num != ctl.ack_number {
        ctl.duplicate_acks = ctl.duplicate_acks.saturating_add(1);
        klog!(
            Debug,
            "tcp: {} out of order seq={} expected={} (dup #{})",
            socket.key(),
            seg.header.seq_num,
            ctl.ack_number,
            ctl.duplicate_acks
        );
        if ctl.duplicate_acks < stack.config().max_duplicate_acks {
            if let Err(e) = socket.send_ack(ctl, stack, true) {
                klog!(Debug, "tcp: {} duplicate ack failed: {}", socket.key(), e);
            }
        }
        return ProcessResult::Handled;
    }
    ctl.duplicate_acks = 0;

    if seg.header.is_fin() {
        if !seg.payload.is_empty() {
            ctl.did_receive(seg.payload, seg.timestamp_ms);
        }
        ctl.ack_number = seg.ack_past_payload(1);
        send_delayed_tcp_ack(stack, socket, ctl);
        ctl.set_state(TcpState::CloseWait);
        ctl.connected = false;
        return ProcessResult::Handled;
    }

    if !seg.payload.is_empty() && ctl.did_receive(seg.payload, seg.timestamp_ms) {
        ctl.ack_number = seg.ack_past_payload(0);
        send_delayed_tcp_ack(stack, socket, ctl);
    }
    ProcessResult::Handled
}
