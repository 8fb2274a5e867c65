//! Socket layer seen by the packet-processing core
//!
//! # TCP
//!
//! Each [`TcpSocket`] guards its mutable protocol state ([`TcpControl`]) with
//! its own lock. Every primitive that sends or mutates takes the locked
//! control block explicitly, so a caller holds exactly one connection lock
//! for the duration of one segment or one timer action:
//!
//! ```text
//!   let mut ctl = socket.lock();
//!   socket.send_tcp_packet(&mut ctl, stack, TCP_FLAG_ACK, &[])?;
//! ```
//!
//! Passive opens create a child per SYN. The child remembers its listening
//! parent (the originator) through a weak reference until the handshake
//! completes, then moves onto the parent's accept queue:
//!
//! ```text
//!   Listen parent                child
//!   -------------                -----
//!   SYN      -> try_create_client -> SynReceived  (pending_children += 1)
//!   ACK                           -> Established  -> release_to_originator
//!                                                    (pending -= 1, queued)
//! ```
//!
//! # UDP / raw ICMP
//!
//! UDP sockets are bound by local port and queue whole datagrams. Raw ICMP
//! sockets receive a copy of every inbound ICMP datagram.
//!
//! # Reclaiming
//!
//! A connection leaves the [`SocketTable`] once it is `Closed` and nothing
//! outside the core can reach it: a passive child that closed before it was
//! handed to its listener, or a connection its owner already closed.
//! `TimeWait` lasts `time_wait_timeout` and ends in `Closed`.
//!
//! # Locking
//!
//! Lock order is listener, then child, then table (or registry). Lookups
//! clone the `Arc` out and release the table before locking the socket, and
//! the table lock is only ever taken after a connection lock, never before.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard, RwLock};

use crate::adapter::TxError;
use crate::ipv4::{Ipv4Addr, Ipv4Proto};
use crate::route::route_to;
use crate::stack::NetworkStack;
use crate::tcp::{
    build_tcp_segment, seq_le, TcpConnKey, TcpHeader, TcpOptionKind, TcpState, TCP_DEFAULT_WINDOW,
    TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN, TCP_IPV4_OVERHEAD,
    TCP_MAX_ACCEPT_BACKLOG, TCP_RECEIVE_BUFFER_SIZE,
};
use crate::DEFAULT_MTU;

// ============================================================================
// Constants
// ============================================================================

/// Datagrams a UDP socket buffers before dropping new ones
pub const UDP_RX_QUEUE_LEN: usize = 64;

/// Packets a raw ICMP socket buffers before dropping new ones
pub const ICMP_RX_QUEUE_LEN: usize = 64;

// ============================================================================
// Error Types
// ============================================================================

/// Why a connection attempt failed. Recorded on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TcpConnectError {
    #[error("fin received during connect")]
    FinDuringConnect,
    #[error("rst received during connect")]
    RstDuringConnect,
    #[error("unexpected flags during connect")]
    UnexpectedFlagsDuringConnect,
    #[error("retransmission limit reached")]
    RetransmitTimeout,
}

/// Socket-layer failures reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    #[error("address already in use")]
    AddressInUse,
    #[error("accept backlog full")]
    BacklogFull,
    #[error("socket not connected")]
    NotConnected,
    #[error("operation invalid in current state")]
    InvalidState,
    #[error(transparent)]
    Tx(#[from] TxError),
}

// ============================================================================
// TCP Connection
// ============================================================================

/// How a connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Unspecified,
    /// Active open (`connect`)
    Outgoing,
    /// Child created by a listener for an inbound SYN
    Incoming,
    /// The listener itself
    Passive,
}

/// A sent segment waiting to be acknowledged.
#[derive(Debug)]
struct UnackedSegment {
    /// Complete TCP segment as transmitted (header + options + payload)
    segment: Vec<u8>,
    /// Sequence number just past this segment
    seq_end: u32,
}

/// Mutable protocol state of one connection, guarded by [`TcpSocket::lock`].
#[derive(Debug)]
pub struct TcpControl {
    pub state: TcpState,
    pub direction: Direction,
    /// Next sequence number to send
    pub sequence_number: u32,
    /// Next sequence number expected from the peer
    pub ack_number: u32,
    pub last_ack_number_sent: u32,
    pub last_ack_sent_ms: u64,
    pub duplicate_acks: u32,
    pub send_window_scale: u8,
    pub connected: bool,
    pub error: Option<TcpConnectError>,
    originator: Option<Weak<TcpSocket>>,
    receive_buffer: VecDeque<u8>,
    unacked: VecDeque<UnackedSegment>,
    retransmit_attempts: u32,
    last_retransmit_ms: u64,
    /// Set once `close` started an orderly close
    closed_by_owner: bool,
    /// Set once a passive child moved onto its listener's accept queue
    handed_off: bool,
    time_wait_since_ms: u64,
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
}

impl TcpControl {
    fn new(direction: Direction) -> Self {
        TcpControl {
            state: TcpState::Closed,
            direction,
            sequence_number: 0,
            ack_number: 0,
            last_ack_number_sent: 0,
            last_ack_sent_ms: 0,
            duplicate_acks: 0,
            send_window_scale: 0,
            connected: false,
            error: None,
            originator: None,
            receive_buffer: VecDeque::new(),
            unacked: VecDeque::new(),
            retransmit_attempts: 0,
            last_retransmit_ms: 0,
            closed_by_owner: false,
            handed_off: false,
            time_wait_since_ms: 0,
            packets_in: 0,
            bytes_in: 0,
            packets_out: 0,
            bytes_out: 0,
        }
    }

    /// Move to `state`.
    ///
    /// Entering `Closed` drops the unacknowledged queue, clears `connected`
    /// and gives a half-open child's backlog slot back to its listener.
    pub fn set_state(&mut self, state: TcpState) {
        if self.state == state {
            return;
        }
        klog!(Trace, "tcp: {:?} -> {:?}", self.state, state);
        if state == TcpState::Closed {
            if let Some(parent) = self.originator.take().and_then(|w| w.upgrade()) {
                parent.release_pending_slot();
            }
            self.unacked.clear();
            self.connected = false;
        }
        self.state = state;
    }

    /// Whether a passive-open child still has a listener to hand off to.
    pub fn has_originator(&self) -> bool {
        self.originator
            .as_ref()
            .is_some_and(|w| w.strong_count() > 0)
    }

    /// Start the `TimeWait` linger at `now_ms`.
    pub fn enter_time_wait(&mut self, now_ms: u64) {
        self.set_state(TcpState::TimeWait);
        self.time_wait_since_ms = now_ms;
    }

    /// No handle outside the core refers to this connection.
    fn is_unowned(&self) -> bool {
        self.closed_by_owner || (self.direction == Direction::Incoming && !self.handed_off)
    }

    /// Append in-order payload to the receive buffer.
    ///
    /// Returns `false` when the buffer cannot hold all of it; nothing is
    /// appended in that case and the peer will retransmit.
    pub fn did_receive(&mut self, payload: &[u8], _timestamp_ms: u64) -> bool {
        if self.receive_buffer.len() + payload.len() > TCP_RECEIVE_BUFFER_SIZE {
            klog!(
                Debug,
                "tcp: receive buffer full ({} + {} bytes)",
                self.receive_buffer.len(),
                payload.len()
            );
            return false;
        }
        self.receive_buffer.extend(payload.iter().copied());
        true
    }

    /// Advertised receive window.
    pub fn receive_window(&self) -> u16 {
        let free = TCP_RECEIVE_BUFFER_SIZE.saturating_sub(self.receive_buffer.len());
        free.min(TCP_DEFAULT_WINDOW as usize) as u16
    }

    pub fn received_len(&self) -> usize {
        self.receive_buffer.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn retransmit_attempts(&self) -> u32 {
        self.retransmit_attempts
    }

    /// Whether the next acknowledgement may wait for the delayed-ACK flush.
    ///
    /// Not once two full segments are unacknowledged, and not once the
    /// last ACK is older than `delayed_ack_max`.
    pub fn should_delay_next_ack(&self, stack: &NetworkStack) -> bool {
        let config = stack.config();
        let outstanding = self.ack_number.wrapping_sub(self.last_ack_number_sent) as usize;
        if outstanding >= 2 * config.delayed_ack_segment_bytes {
            return false;
        }
        let elapsed = stack.now_ms().saturating_sub(self.last_ack_sent_ms);
        elapsed < config.delayed_ack_max.as_millis() as u64
    }
}

/// One TCP endpoint: listener, active-open connection or passive child.
#[derive(Debug)]
pub struct TcpSocket {
    id: u64,
    key: TcpConnKey,
    control: Mutex<TcpControl>,
    accept_queue: Mutex<VecDeque<Arc<TcpSocket>>>,
    pending_children: AtomicUsize,
    backlog: usize,
}

impl TcpSocket {
    fn new(id: u64, key: TcpConnKey, direction: Direction, backlog: usize) -> Self {
        TcpSocket {
            id,
            key,
            control: Mutex::new(TcpControl::new(direction)),
            accept_queue: Mutex::new(VecDeque::new()),
            pending_children: AtomicUsize::new(0),
            backlog: backlog.min(TCP_MAX_ACCEPT_BACKLOG),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> TcpConnKey {
        self.key
    }

    /// Take this connection's lock.
    pub fn lock(&self) -> MutexGuard<'_, TcpControl> {
        self.control.lock()
    }

    pub fn state(&self) -> TcpState {
        self.control.lock().state
    }

    /// Next fully established child, if any.
    pub fn accept(&self) -> Option<Arc<TcpSocket>> {
        self.accept_queue.lock().pop_front()
    }

    /// Children waiting in the accept queue.
    pub fn accept_queue_len(&self) -> usize {
        self.accept_queue.lock().len()
    }

    /// Children still completing their handshake.
    pub fn pending_children(&self) -> usize {
        self.pending_children.load(Ordering::Acquire)
    }

    /// Copy received bytes into `buf`, returning how many were read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut ctl = self.control.lock();
        let n = buf.len().min(ctl.receive_buffer.len());
        for (dst, src) in buf.iter_mut().zip(ctl.receive_buffer.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn release_pending_slot(&self) {
        let _ = self
            .pending_children
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn mss(&self, stack: &NetworkStack) -> usize {
        let mtu = stack
            .adapter_for_ipv4(self.key.local_ip)
            .map_or(DEFAULT_MTU, |a| a.mtu());
        mtu.saturating_sub(TCP_IPV4_OVERHEAD).clamp(1, u16::MAX as usize)
    }

    // ========================================================================
    // Segment Transmission
    // ========================================================================

    /// Build and transmit one segment carrying `flags` and `payload`.
    ///
    /// Sequence accounting happens before transmission: SYN and FIN consume
    /// one sequence number, payload its length, and segments that expect an
    /// acknowledgement are queued for retransmission even if this attempt
    /// fails.
    pub fn send_tcp_packet(
        self: &Arc<Self>,
        ctl: &mut TcpControl,
        stack: &NetworkStack,
        flags: u8,
        payload: &[u8],
    ) -> Result<(), TxError> {
        let now = stack.now_ms();
        let with_ack = flags & TCP_FLAG_ACK != 0;
        let header = TcpHeader::new(
            self.key.local_port,
            self.key.remote_port,
            ctl.sequence_number,
            if with_ack { ctl.ack_number } else { 0 },
            flags,
            ctl.receive_window(),
        );
        let mss_option = [TcpOptionKind::Mss(self.mss(stack) as u16)];
        let options: &[TcpOptionKind] = if flags == TCP_FLAG_SYN { &mss_option } else { &[] };
        let segment = build_tcp_segment(self.key.local_ip, self.key.remote_ip, &header, options, payload);

        let consumed = payload.len() as u32
            + u32::from(flags & TCP_FLAG_SYN != 0)
            + u32::from(flags & TCP_FLAG_FIN != 0);
        let seq_end = ctl.sequence_number.wrapping_add(consumed);

        if with_ack {
            ctl.last_ack_number_sent = ctl.ack_number;
            ctl.last_ack_sent_ms = now;
        }
        let transmitted = self.transmit(stack, &segment);

        if consumed > 0 {
            if ctl.unacked.is_empty() {
                ctl.last_retransmit_ms = now;
            }
            ctl.unacked.push_back(UnackedSegment { segment: segment.clone(), seq_end });
            stack.retransmits().register(self);
        }
        ctl.sequence_number = seq_end;
        ctl.packets_out += 1;
        ctl.bytes_out += payload.len() as u64;
        if flags & TCP_FLAG_RST != 0 {
            stack.stats().inc_resets_tx();
        }

        klog!(
            Trace,
            "tcp: {} tx flags={:#04x} len={} ok={}",
            self.key,
            flags,
            payload.len(),
            transmitted.is_ok()
        );
        transmitted
    }

    fn transmit(&self, stack: &NetworkStack, segment: &[u8]) -> Result<(), TxError> {
        let route = route_to(stack, self.key.remote_ip, self.key.local_ip).ok_or(TxError::NoRoute)?;
        route.send_ipv4(
            self.key.local_ip,
            self.key.remote_ip,
            Ipv4Proto::Tcp,
            stack.config().default_ttl,
            segment,
        )
    }

    /// Acknowledge `ack_number`, skipping a repeat of the last ACK unless
    /// `allow_duplicate` is set.
    pub fn send_ack(
        self: &Arc<Self>,
        ctl: &mut TcpControl,
        stack: &NetworkStack,
        allow_duplicate: bool,
    ) -> Result<(), TxError> {
        if !allow_duplicate && ctl.last_ack_number_sent == ctl.ack_number {
            return Ok(());
        }
        self.send_tcp_packet(ctl, stack, TCP_FLAG_ACK, &[])
    }

    /// Drop every queued segment covered by the peer's `ack`.
    pub fn receive_ack(&self, ctl: &mut TcpControl, stack: &NetworkStack, ack: u32) {
        let before = ctl.unacked.len();
        while ctl.unacked.front().is_some_and(|s| seq_le(s.seq_end, ack)) {
            ctl.unacked.pop_front();
        }
        if ctl.unacked.len() != before {
            ctl.retransmit_attempts = 0;
            ctl.last_retransmit_ms = stack.now_ms();
        }
        if ctl.unacked.is_empty() {
            stack.retransmits().unregister(self.id);
        }
    }

    /// Resend every unacknowledged segment if the backoff interval elapsed.
    ///
    /// The interval is `retransmit_base * 2^attempts`. Once
    /// `max_retransmits` attempts went unanswered the connection closes
    /// with [`TcpConnectError::RetransmitTimeout`].
    pub fn retransmit_packets(&self, ctl: &mut TcpControl, stack: &NetworkStack) {
        let config = stack.config();
        let now = stack.now_ms();
        if ctl.state == TcpState::TimeWait {
            let linger = config.time_wait_timeout.as_millis() as u64;
            if now.saturating_sub(ctl.time_wait_since_ms) >= linger {
                klog!(Debug, "tcp: {} time-wait expired", self.key);
                ctl.set_state(TcpState::Closed);
                stack.retransmits().unregister(self.id);
                self.reclaim_if_unowned(ctl, stack);
            }
            return;
        }
        if ctl.unacked.is_empty() {
            stack.retransmits().unregister(self.id);
            return;
        }

        let base = config.retransmit_base.as_millis() as u64;
        let interval = base.saturating_mul(1u64 << ctl.retransmit_attempts.min(16));
        if now.saturating_sub(ctl.last_retransmit_ms) < interval {
            return;
        }

        if ctl.retransmit_attempts >= config.max_retransmits {
            klog!(
                Warn,
                "tcp: {} giving up after {} retransmits",
                self.key,
                ctl.retransmit_attempts
            );
            ctl.error = Some(TcpConnectError::RetransmitTimeout);
            ctl.set_state(TcpState::Closed);
            stack.retransmits().unregister(self.id);
            self.reclaim_if_unowned(ctl, stack);
            return;
        }

        ctl.retransmit_attempts += 1;
        ctl.last_retransmit_ms = now;
        for unacked in ctl.unacked.iter() {
            if let Err(e) = self.transmit(stack, &unacked.segment) {
                klog!(Debug, "tcp: {} retransmit failed: {}", self.key, e);
                break;
            }
            stack.stats().inc_segments_retransmitted();
        }
    }

    /// Drop a `Closed` connection nobody owns from the table and timer sets.
    ///
    /// Returns whether it was removed.
    pub fn reclaim_if_unowned(&self, ctl: &TcpControl, stack: &NetworkStack) -> bool {
        if ctl.state != TcpState::Closed || !ctl.is_unowned() {
            return false;
        }
        stack.retransmits().unregister(self.id);
        let removed = stack.sockets().remove_tcp(self);
        if removed {
            klog!(Debug, "tcp: {} reclaimed", self.key);
        }
        removed
    }

    // ========================================================================
    // Passive Open
    // ========================================================================

    /// Create and register a child connection for an inbound SYN on this
    /// listener.
    pub fn try_create_client(
        self: &Arc<Self>,
        stack: &NetworkStack,
        key: TcpConnKey,
    ) -> Result<Arc<TcpSocket>, SocketError> {
        if self.pending_children() + self.accept_queue_len() >= self.backlog {
            return Err(SocketError::BacklogFull);
        }
        let child = stack.sockets().new_tcp_socket(key, Direction::Incoming, 0);
        child.lock().originator = Some(Arc::downgrade(self));
        stack.sockets().insert_tcp(child.clone())?;
        self.pending_children.fetch_add(1, Ordering::AcqRel);
        Ok(child)
    }

    /// Move this established child onto its listener's accept queue.
    ///
    /// Returns `false` if the listener is gone.
    pub fn release_to_originator(self: &Arc<Self>, ctl: &mut TcpControl) -> bool {
        let Some(parent) = ctl.originator.take().and_then(|w| w.upgrade()) else {
            return false;
        };
        parent.release_pending_slot();
        parent.accept_queue.lock().push_back(self.clone());
        ctl.handed_off = true;
        ctl.connected = true;
        true
    }

    // ========================================================================
    // Application Operations
    // ========================================================================

    /// Send `data` as PSH+ACK segments of at most one MSS each.
    pub fn send(self: &Arc<Self>, stack: &NetworkStack, data: &[u8]) -> Result<usize, SocketError> {
        let mut ctl = self.lock();
        if !ctl.state.can_send() {
            return Err(SocketError::NotConnected);
        }
        let mss = self.mss(stack);
        for chunk in data.chunks(mss) {
            self.send_tcp_packet(&mut ctl, stack, TCP_FLAG_PSH | TCP_FLAG_ACK, chunk)?;
        }
        Ok(data.len())
    }

    /// Begin an orderly close, or drop a connection that never opened.
    pub fn close(self: &Arc<Self>, stack: &NetworkStack) -> Result<(), SocketError> {
        let mut ctl = self.lock();
        let state = ctl.state;
        match state {
            TcpState::Established => {
                self.send_tcp_packet(&mut ctl, stack, TCP_FLAG_FIN | TCP_FLAG_ACK, &[])?;
                ctl.set_state(TcpState::FinWait1);
                ctl.connected = false;
                ctl.closed_by_owner = true;
                Ok(())
            }
            TcpState::CloseWait => {
                self.send_tcp_packet(&mut ctl, stack, TCP_FLAG_FIN | TCP_FLAG_ACK, &[])?;
                ctl.set_state(TcpState::LastAck);
                ctl.closed_by_owner = true;
                Ok(())
            }
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => {
                ctl.set_state(TcpState::Closed);
                drop(ctl);
                stack.retransmits().unregister(self.id);
                stack.sockets().remove_tcp(self);
                Ok(())
            }
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => Err(SocketError::InvalidState),
        }
    }
}

// ============================================================================
// UDP Socket
// ============================================================================

/// A datagram queued on a [`UdpSocket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Port-bound UDP receiver.
#[derive(Debug)]
pub struct UdpSocket {
    port: u16,
    memberships: RwLock<Vec<Ipv4Addr>>,
    queue: Mutex<VecDeque<UdpDatagram>>,
    dropped: AtomicU64,
}

impl UdpSocket {
    fn new(port: u16) -> Self {
        UdpSocket {
            port,
            memberships: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn join_multicast(&self, group: Ipv4Addr) {
        let mut groups = self.memberships.write();
        if !groups.contains(&group) {
            groups.push(group);
        }
    }

    pub fn leave_multicast(&self, group: Ipv4Addr) {
        self.memberships.write().retain(|g| *g != group);
    }

    pub fn is_member(&self, group: Ipv4Addr) -> bool {
        self.memberships.read().contains(&group)
    }

    /// Queue a datagram. Returns `false` if the queue is full.
    pub fn did_receive(&self, datagram: UdpDatagram) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= UDP_RX_QUEUE_LEN {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(datagram);
        true
    }

    pub fn recv(&self) -> Option<UdpDatagram> {
        self.queue.lock().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Raw ICMP Socket
// ============================================================================

/// An ICMP datagram queued on an [`IcmpSocket`], IPv4 header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub src: Ipv4Addr,
    pub datagram: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Raw socket receiving every inbound ICMP datagram.
#[derive(Debug)]
pub struct IcmpSocket {
    id: u64,
    queue: Mutex<VecDeque<IcmpPacket>>,
}

impl IcmpSocket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn did_receive(&self, src: Ipv4Addr, datagram: &[u8], timestamp_ms: u64) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= ICMP_RX_QUEUE_LEN {
            return false;
        }
        queue.push_back(IcmpPacket {
            src,
            datagram: datagram.to_vec(),
            timestamp_ms,
        });
        true
    }

    pub fn recv(&self) -> Option<IcmpPacket> {
        self.queue.lock().pop_front()
    }
}

// ============================================================================
// Socket Table
// ============================================================================

/// Every socket the core can deliver to.
#[derive(Debug, Default)]
pub struct SocketTable {
    tcp: RwLock<BTreeMap<TcpConnKey, Arc<TcpSocket>>>,
    udp: RwLock<BTreeMap<u16, Arc<UdpSocket>>>,
    icmp: RwLock<Vec<Arc<IcmpSocket>>>,
    next_id: AtomicU64,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Allocate an unregistered TCP socket.
    pub fn new_tcp_socket(&self, key: TcpConnKey, direction: Direction, backlog: usize) -> Arc<TcpSocket> {
        Arc::new(TcpSocket::new(self.next_id(), key, direction, backlog))
    }

    pub fn insert_tcp(&self, socket: Arc<TcpSocket>) -> Result<(), SocketError> {
        let mut tcp = self.tcp.write();
        if tcp.contains_key(&socket.key) {
            return Err(SocketError::AddressInUse);
        }
        tcp.insert(socket.key, socket);
        Ok(())
    }

    /// Unregister `socket`, leaving any other socket under the same key alone.
    pub fn remove_tcp(&self, socket: &TcpSocket) -> bool {
        let mut tcp = self.tcp.write();
        if tcp.get(&socket.key).is_some_and(|s| s.id == socket.id) {
            tcp.remove(&socket.key);
            return true;
        }
        false
    }

    /// Find the socket for `key`: exact tuple, then a listener on the local
    /// address and port, then a wildcard listener on the port.
    pub fn lookup_tcp(&self, key: &TcpConnKey) -> Option<Arc<TcpSocket>> {
        let tcp = self.tcp.read();
        tcp.get(key)
            .or_else(|| tcp.get(&TcpConnKey::listener(key.local_ip, key.local_port)))
            .or_else(|| tcp.get(&TcpConnKey::listener(Ipv4Addr::UNSPECIFIED, key.local_port)))
            .cloned()
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.read().len()
    }

    pub fn bind_udp(&self, port: u16) -> Result<Arc<UdpSocket>, SocketError> {
        let mut udp = self.udp.write();
        if udp.contains_key(&port) {
            return Err(SocketError::AddressInUse);
        }
        let socket = Arc::new(UdpSocket::new(port));
        udp.insert(port, socket.clone());
        Ok(socket)
    }

    pub fn unbind_udp(&self, port: u16) -> Option<Arc<UdpSocket>> {
        self.udp.write().remove(&port)
    }

    pub fn lookup_udp(&self, port: u16) -> Option<Arc<UdpSocket>> {
        self.udp.read().get(&port).cloned()
    }

    pub fn open_icmp(&self) -> Arc<IcmpSocket> {
        let socket = Arc::new(IcmpSocket {
            id: self.next_id(),
            queue: Mutex::new(VecDeque::new()),
        });
        self.icmp.write().push(socket.clone());
        socket
    }

    pub fn close_icmp(&self, id: u64) {
        self.icmp.write().retain(|s| s.id != id);
    }

    /// Snapshot of the raw ICMP sockets.
    pub fn icmp_sockets(&self) -> Vec<Arc<IcmpSocket>> {
        self.icmp.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn test_lookup_prefers_exact_then_listener() {
        let table = SocketTable::new();
        let wildcard = table.new_tcp_socket(TcpConnKey::listener(Ipv4Addr::UNSPECIFIED, 80), Direction::Passive, 4);
        table.insert_tcp(wildcard.clone()).unwrap();

        let key = TcpConnKey::new(LOCAL, 80, PEER, 40000);
        assert_eq!(table.lookup_tcp(&key).map(|s| s.id()), Some(wildcard.id()));

        let bound = table.new_tcp_socket(TcpConnKey::listener(LOCAL, 80), Direction::Passive, 4);
        table.insert_tcp(bound.clone()).unwrap();
        assert_eq!(table.lookup_tcp(&key).map(|s| s.id()), Some(bound.id()));

        let exact = table.new_tcp_socket(key, Direction::Incoming, 0);
        table.insert_tcp(exact.clone()).unwrap();
        assert_eq!(table.lookup_tcp(&key).map(|s| s.id()), Some(exact.id()));

        assert!(table.lookup_tcp(&TcpConnKey::new(LOCAL, 81, PEER, 40000)).is_none());
    }

    #[test]
    fn test_insert_duplicate_key() {
        let table = SocketTable::new();
        let key = TcpConnKey::new(LOCAL, 80, PEER, 40000);
        table.insert_tcp(table.new_tcp_socket(key, Direction::Outgoing, 0)).unwrap();
        let again = table.new_tcp_socket(key, Direction::Outgoing, 0);
        assert_eq!(table.insert_tcp(again.clone()), Err(SocketError::AddressInUse));
        assert!(!table.remove_tcp(&again));
        assert_eq!(table.tcp_count(), 1);
    }

    #[test]
    fn test_receive_buffer_limit() {
        let mut ctl = TcpControl::new(Direction::Outgoing);
        assert!(ctl.did_receive(&[1, 2, 3], 0));
        assert_eq!(ctl.received_len(), 3);
        assert_eq!(ctl.receive_window(), TCP_DEFAULT_WINDOW);

        let big = vec![0u8; TCP_RECEIVE_BUFFER_SIZE];
        assert!(!ctl.did_receive(&big, 0));
        assert_eq!(ctl.received_len(), 3);
    }

    #[test]
    fn test_closing_child_returns_backlog_slot() {
        let table = SocketTable::new();
        let parent = table.new_tcp_socket(TcpConnKey::listener(LOCAL, 80), Direction::Passive, 2);
        parent.pending_children.store(1, Ordering::Release);

        let mut child = TcpControl::new(Direction::Incoming);
        child.originator = Some(Arc::downgrade(&parent));
        child.state = TcpState::SynReceived;
        assert!(child.has_originator());

        child.set_state(TcpState::Closed);
        assert_eq!(parent.pending_children(), 0);
        assert!(!child.has_originator());
    }

    #[test]
    fn test_udp_membership_and_queue() {
        let table = SocketTable::new();
        let sock = table.bind_udp(5353).unwrap();
        assert_eq!(table.bind_udp(5353).err(), Some(SocketError::AddressInUse));

        let group = Ipv4Addr::new(224, 0, 0, 251);
        assert!(!sock.is_member(group));
        sock.join_multicast(group);
        sock.join_multicast(group);
        assert!(sock.is_member(group));
        sock.leave_multicast(group);
        assert!(!sock.is_member(group));

        for i in 0..UDP_RX_QUEUE_LEN {
            assert!(sock.did_receive(UdpDatagram {
                src: PEER,
                src_port: 1000,
                dst: LOCAL,
                payload: vec![i as u8],
                timestamp_ms: 0,
            }));
        }
        assert!(!sock.did_receive(UdpDatagram {
            src: PEER,
            src_port: 1000,
            dst: LOCAL,
            payload: vec![],
            timestamp_ms: 0,
        }));
        assert_eq!(sock.dropped(), 1);
        assert_eq!(sock.recv().map(|d| d.payload), Some(vec![0]));
    }

    #[test]
    fn test_icmp_sockets_snapshot() {
        let table = SocketTable::new();
        let a = table.open_icmp();
        let b = table.open_icmp();
        assert_eq!(table.icmp_sockets().len(), 2);
        table.close_icmp(a.id());
        let left = table.icmp_sockets();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id(), b.id());
    }
}
