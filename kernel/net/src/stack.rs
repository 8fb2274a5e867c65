//! Network stack context and frame demultiplexing
//!
//! [`NetworkStack`] owns every piece of shared state the worker touches:
//! adapters, the ARP table, the socket table, the delayed-ACK set, the
//! retransmission registry, counters and the frame-arrival signal. Handlers
//! receive it by reference instead of reaching for globals.
//!
//! # Dispatch
//!
//! ```text
//!     process_frame
//!          |
//!     +----v-----+   ARP   +------------+
//!     | Ethernet |-------->| handle_arp |  learn sender, answer requests
//!     +----+-----+         +------------+
//!          | IPv4                     | IPv6
//!     +----v--------+           +-----v-------+
//!     | handle_ipv4 |           | handle_ipv6 |
//!     +--+---+---+--+           +-----+-------+
//!        |   |   |                    | ICMPv6 (UDP/TCP: logged only)
//!    ICMP  UDP  TCP              +----v----------+
//!        |   |   |               | handle_icmpv6 |  echo, neighbor discovery
//!        v   v   v               +---------------+
//!   raw fan-out   tcp_input::handle_tcp
//!   + echo reply
//! ```
//!
//! Malformed input is logged, counted and dropped. Replies that cannot get
//! a packet buffer are abandoned.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use spin::RwLock;

use crate::adapter::{NetworkAdapter, TxError};
use crate::arp::{parse_arp, ArpCache, ArpError, ArpOp, ArpPacket, ArpUpdate};
use crate::delayed_ack::{flush_delayed_tcp_acks, DelayedAckSet};
use crate::ethernet::{parse_ethernet, EthAddr, EthError, EthHeader, EtherType};
use crate::icmp::{parse_icmp, write_echo_reply, IcmpError, ICMP_TYPE_ECHO_REQUEST};
use crate::icmpv6::{
    self, parse_icmpv6, solicitation_target, write_neighbor_advertisement, Icmpv6Error, Icmpv6Type,
    NEIGHBOR_ADVERTISEMENT_LEN,
};
use crate::ipv4::{parse_ipv4, Ipv4Addr, Ipv4Error, Ipv4Header, Ipv4Proto};
use crate::ipv6::{parse_ipv6, Ipv6Addr, Ipv6Error, Ipv6Header, Ipv6NextHeader, NDP_HOP_LIMIT};
use crate::retransmit::{retransmit_tcp_packets, RetransmitRegistry};
use crate::route::{route_to, send_arp_packet};
use crate::socket::{Direction, IcmpSocket, SocketError, SocketTable, TcpSocket, UdpDatagram, UdpSocket};
use crate::tcp::{TcpConnKey, TcpError, TcpState, TCP_FLAG_SYN};
use crate::tcp_input::handle_tcp;
use crate::time::{Clock, MonotonicClock};
use crate::udp::{parse_udp, UdpError};
use crate::wait::FrameSignal;
use crate::ETH_HEADER_SIZE;

// ============================================================================
// Configuration
// ============================================================================

/// Tunables of the stack. `Default` gives the values the worker is
/// normally run with.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Bounded wait when no frames are pending
    pub idle_timeout: Duration,
    /// Size of the single reusable receive buffer
    pub scratch_buffer_size: usize,
    /// ISN of passively opened children
    pub initial_sequence_number: u32,
    /// Out-of-order segments re-send the current ACK while below this count
    pub max_duplicate_acks: u32,
    /// TTL of synthesized IPv4 datagrams
    pub default_ttl: u8,
    /// Hop limit of synthesized IPv6 echo replies
    pub default_hop_limit: u8,
    /// Maximum age of a delayed acknowledgement
    pub delayed_ack_max: Duration,
    /// Delay ends once two segments of this size are unacknowledged
    pub delayed_ack_segment_bytes: usize,
    /// Retransmit attempts before a connection is closed
    pub max_retransmits: u32,
    /// First retransmission interval, doubled per attempt
    pub retransmit_base: Duration,
    /// How long a connection lingers in `TimeWait` before it closes
    pub time_wait_timeout: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            idle_timeout: Duration::from_millis(500),
            scratch_buffer_size: 64 * 1024,
            initial_sequence_number: 1000,
            max_duplicate_acks: 5,
            default_ttl: 64,
            default_hop_limit: 64,
            delayed_ack_max: Duration::from_millis(500),
            delayed_ack_segment_bytes: 1500,
            max_retransmits: 3,
            retransmit_base: Duration::from_secs(1),
            time_wait_timeout: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Network stack statistics
#[derive(Debug, Default)]
pub struct NetStats {
    /// Frames handed to `process_frame`
    pub rx_frames: AtomicU64,
    /// Frames/datagrams/segments dropped as malformed
    pub rx_malformed: AtomicU64,
    pub arp_rx: AtomicU64,
    pub ipv4_rx: AtomicU64,
    pub ipv6_rx: AtomicU64,
    pub icmp_rx: AtomicU64,
    pub icmpv6_rx: AtomicU64,
    pub udp_rx: AtomicU64,
    pub tcp_rx: AtomicU64,
    /// ARP, ICMP and ICMPv6 replies transmitted
    pub replies_tx: AtomicU64,
    /// TCP resets transmitted
    pub resets_tx: AtomicU64,
    pub delayed_acks_flushed: AtomicU64,
    pub retransmit_passes: AtomicU64,
    pub segments_retransmitted: AtomicU64,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub(crate) fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl NetStats {
    counter! {
        inc_rx_frames => rx_frames,
        inc_malformed => rx_malformed,
        inc_arp_rx => arp_rx,
        inc_ipv4_rx => ipv4_rx,
        inc_ipv6_rx => ipv6_rx,
        inc_icmp_rx => icmp_rx,
        inc_icmpv6_rx => icmpv6_rx,
        inc_udp_rx => udp_rx,
        inc_tcp_rx => tcp_rx,
        inc_replies_tx => replies_tx,
        inc_resets_tx => resets_tx,
        inc_retransmit_passes => retransmit_passes,
        inc_segments_retransmitted => segments_retransmitted,
    }

    #[inline]
    pub(crate) fn add_delayed_acks_flushed(&self, n: u64) {
        self.delayed_acks_flushed.fetch_add(n, Ordering::Relaxed);
    }

    /// Read one counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Packet Processing Result
// ============================================================================

/// Result of processing an incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Frame consumed, nothing sent in direct reply
    Handled,
    /// Frame consumed and a reply was transmitted
    Replied,
    /// Frame was dropped with reason
    Dropped(DropReason),
}

/// Reason for dropping a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Shorter than an Ethernet header
    Truncated,
    Eth(EthError),
    Arp(ArpError),
    Ipv4(Ipv4Error),
    Ipv6(Ipv6Error),
    Icmp(IcmpError),
    Icmpv6(Icmpv6Error),
    Udp(UdpError),
    Tcp(TcpError),
    UnknownEtherType,
    /// Transport protocol not handled on this path
    UnsupportedProtocol,
    /// Destination is not one of our addresses
    NotForUs,
    /// No socket bound for the destination
    NoSocket,
    /// A reply could not be routed
    NoRoute,
    /// A reply could not get a packet buffer or failed to transmit
    NoBuffer,
    /// A socket or listener refused the traffic
    Rejected,
}

// ============================================================================
// Network Stack
// ============================================================================

/// Shared state of the network core.
pub struct NetworkStack {
    config: StackConfig,
    clock: Arc<dyn Clock>,
    adapters: RwLock<Vec<Arc<dyn NetworkAdapter>>>,
    arp: ArpCache,
    sockets: SocketTable,
    delayed_acks: DelayedAckSet,
    retransmits: RetransmitRegistry,
    stats: NetStats,
    signal: FrameSignal,
    pending_frames: AtomicUsize,
    shutdown: AtomicBool,
    worker_running: AtomicBool,
    isn_offset: AtomicU32,
}

impl NetworkStack {
    pub fn new(config: StackConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(NetworkStack {
            config,
            clock,
            adapters: RwLock::new(Vec::new()),
            arp: ArpCache::new(),
            sockets: SocketTable::new(),
            delayed_acks: DelayedAckSet::new(),
            retransmits: RetransmitRegistry::new(),
            stats: NetStats::default(),
            signal: FrameSignal::new(),
            pending_frames: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            worker_running: AtomicBool::new(false),
            isn_offset: AtomicU32::new(0),
        })
    }

    /// Default configuration on the monotonic clock.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(StackConfig::default(), Arc::new(MonotonicClock::new()))
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn add_adapter(&self, adapter: Arc<dyn NetworkAdapter>) {
        klog_always!(
            "net: adapter {} mac={} ipv4={}",
            adapter.name(),
            adapter.mac_address(),
            adapter.ipv4_address()
        );
        self.adapters.write().push(adapter);
    }

    /// Snapshot of the registered adapters.
    pub fn adapters(&self) -> Vec<Arc<dyn NetworkAdapter>> {
        self.adapters.read().clone()
    }

    /// The adapter configured with `addr`, if any.
    pub fn adapter_for_ipv4(&self, addr: Ipv4Addr) -> Option<Arc<dyn NetworkAdapter>> {
        if addr.is_unspecified() {
            return None;
        }
        self.adapters
            .read()
            .iter()
            .find(|a| a.ipv4_address() == addr)
            .cloned()
    }

    fn is_subnet_broadcast(&self, addr: Ipv4Addr) -> bool {
        self.adapters.read().iter().any(|a| {
            let local = a.ipv4_address();
            !local.is_unspecified() && local.subnet_broadcast(a.ipv4_netmask()) == addr
        })
    }

    pub fn arp(&self) -> &ArpCache {
        &self.arp
    }

    pub fn sockets(&self) -> &SocketTable {
        &self.sockets
    }

    pub fn delayed_acks(&self) -> &DelayedAckSet {
        &self.delayed_acks
    }

    pub fn retransmits(&self) -> &RetransmitRegistry {
        &self.retransmits
    }

    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    pub fn signal(&self) -> &FrameSignal {
        &self.signal
    }

    // ========================================================================
    // Worker Interface
    // ========================================================================

    /// Adapter receive callback: one more frame is queued somewhere.
    pub fn notify_frame_received(&self) {
        self.pending_frames.fetch_add(1, Ordering::AcqRel);
        self.signal.notify();
    }

    pub fn pending_frames(&self) -> usize {
        self.pending_frames.load(Ordering::Acquire)
    }

    /// Copy one queued frame into `buf` from the first adapter that has one.
    pub fn dequeue_frame(&self, buf: &mut [u8]) -> Option<(Arc<dyn NetworkAdapter>, usize, u64)> {
        if self.pending_frames() == 0 {
            return None;
        }
        for adapter in self.adapters() {
            if !adapter.has_queued_packets() {
                continue;
            }
            if let Some((len, timestamp)) = adapter.dequeue_packet(buf) {
                let _ = self
                    .pending_frames
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                return Some((adapter, len, timestamp));
            }
        }
        // Counter ran ahead of the adapters
        self.pending_frames.store(0, Ordering::Release);
        None
    }

    pub fn flush_delayed_acks(&self) {
        flush_delayed_tcp_acks(self);
    }

    pub fn retransmit_pass(&self) {
        retransmit_tcp_packets(self);
    }

    /// One loop turn without waiting: housekeeping, then at most one frame.
    ///
    /// Returns `None` when no frame was pending.
    pub fn poll(&self, scratch: &mut [u8]) -> Option<ProcessResult> {
        self.flush_delayed_acks();
        self.retransmit_pass();
        let (adapter, len, timestamp) = self.dequeue_frame(scratch)?;
        Some(self.process_frame(adapter.as_ref(), &scratch[..len], timestamp))
    }

    /// Poll until no frame is pending, returning how many were processed.
    pub fn run_until_idle(&self) -> usize {
        let mut scratch = vec![0u8; self.config.scratch_buffer_size];
        let mut processed = 0;
        while self.poll(&mut scratch).is_some() {
            processed += 1;
        }
        processed
    }

    /// Ask the worker to exit and wake it.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.signal.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn claim_worker(&self) -> bool {
        self.worker_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_worker(&self) {
        self.worker_running.store(false, Ordering::Release);
    }

    // ========================================================================
    // Frame Processing
    // ========================================================================

    /// Demultiplex one received frame.
    pub fn process_frame(
        &self,
        adapter: &dyn NetworkAdapter,
        frame: &[u8],
        timestamp_ms: u64,
    ) -> ProcessResult {
        self.stats.inc_rx_frames();
        if frame.len() < ETH_HEADER_SIZE {
            self.stats.inc_malformed();
            klog!(Debug, "net: {} byte frame on {} too short", frame.len(), adapter.name());
            return ProcessResult::Dropped(DropReason::Truncated);
        }

        let (eth, payload) = match parse_ethernet(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.inc_malformed();
                return ProcessResult::Dropped(DropReason::Eth(e));
            }
        };

        match EtherType::from_raw(eth.ethertype) {
            Some(EtherType::Arp) => handle_arp(self, payload),
            Some(EtherType::Ipv4) => handle_ipv4(self, &eth, payload, timestamp_ms),
            Some(EtherType::Ipv6) => handle_ipv6(self, adapter, &eth, payload),
            None => {
                klog!(Trace, "net: ignoring ethertype {:#06x}", eth.ethertype);
                ProcessResult::Dropped(DropReason::UnknownEtherType)
            }
        }
    }

    // ========================================================================
    // Socket Operations
    // ========================================================================

    /// Listen on `local_ip:port` (`0.0.0.0` for every address).
    pub fn tcp_listen(&self, local_ip: Ipv4Addr, port: u16, backlog: usize) -> Result<Arc<TcpSocket>, SocketError> {
        let socket = self
            .sockets
            .new_tcp_socket(TcpConnKey::listener(local_ip, port), Direction::Passive, backlog);
        socket.lock().set_state(TcpState::Listen);
        self.sockets.insert_tcp(socket.clone())?;
        klog!(Info, "tcp: listening on {}:{}", local_ip, port);
        Ok(socket)
    }

    /// Active open. The SYN is sent before returning; the handshake
    /// completes on the worker.
    pub fn tcp_connect(
        &self,
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
    ) -> Result<Arc<TcpSocket>, SocketError> {
        let local_ip = if local_ip.is_unspecified() {
            route_to(self, remote_ip, local_ip)
                .map(|r| r.adapter.ipv4_address())
                .ok_or(SocketError::Tx(TxError::NoRoute))?
        } else {
            local_ip
        };

        let key = TcpConnKey::new(local_ip, local_port, remote_ip, remote_port);
        let socket = self.sockets.new_tcp_socket(key, Direction::Outgoing, 0);
        self.sockets.insert_tcp(socket.clone())?;

        let mut ctl = socket.lock();
        let offset = self.isn_offset.fetch_add(64_000, Ordering::Relaxed);
        ctl.sequence_number = self.config.initial_sequence_number.wrapping_add(offset);
        ctl.set_state(TcpState::SynSent);
        if let Err(e) = socket.send_tcp_packet(&mut ctl, self, TCP_FLAG_SYN, &[]) {
            klog!(Debug, "tcp: connect {} failed: {}", key, e);
            ctl.set_state(TcpState::Closed);
            drop(ctl);
            self.retransmits.unregister(socket.id());
            self.sockets.remove_tcp(&socket);
            return Err(e.into());
        }
        drop(ctl);
        Ok(socket)
    }

    pub fn udp_bind(&self, port: u16) -> Result<Arc<UdpSocket>, SocketError> {
        self.sockets.bind_udp(port)
    }

    pub fn icmp_open(&self) -> Arc<IcmpSocket> {
        self.sockets.open_icmp()
    }
}

// ============================================================================
// Reply Helpers
// ============================================================================

/// Transmit a datagram from `adapter`'s own IPv4 address whose payload is
/// produced by `write`.
#[allow(clippy::too_many_arguments)]
fn reply_ipv4<F>(
    stack: &NetworkStack,
    adapter: &dyn NetworkAdapter,
    dst_mac: EthAddr,
    dst: Ipv4Addr,
    proto: Ipv4Proto,
    len: usize,
    write: F,
) -> ProcessResult
where
    F: FnOnce(&mut [u8]) -> bool,
{
    let offset = adapter.ipv4_payload_offset();
    let Some(mut buffer) = adapter.acquire_packet_buffer(offset + len) else {
        klog!(Debug, "net: no tx buffer on {} for reply to {}", adapter.name(), dst);
        return ProcessResult::Dropped(DropReason::NoBuffer);
    };
    let filled = adapter
        .fill_in_ipv4_header(
            &mut buffer,
            adapter.ipv4_address(),
            dst_mac,
            dst,
            proto,
            len,
            stack.config.default_ttl,
        )
        .is_ok()
        && buffer.payload_mut(offset).is_some_and(write);
    if !filled {
        adapter.release_packet_buffer(buffer);
        return ProcessResult::Dropped(DropReason::NoBuffer);
    }
    finish_reply(stack, adapter, adapter.send_buffer(buffer))
}

/// IPv6 counterpart of [`reply_ipv4`].
#[allow(clippy::too_many_arguments)]
fn reply_ipv6<F>(
    stack: &NetworkStack,
    adapter: &dyn NetworkAdapter,
    dst_mac: EthAddr,
    dst: Ipv6Addr,
    len: usize,
    hop_limit: u8,
    write: F,
) -> ProcessResult
where
    F: FnOnce(&mut [u8]) -> bool,
{
    let offset = adapter.ipv6_payload_offset();
    let Some(mut buffer) = adapter.acquire_packet_buffer(offset + len) else {
        klog!(Debug, "net: no tx buffer on {} for reply to {}", adapter.name(), dst);
        return ProcessResult::Dropped(DropReason::NoBuffer);
    };
    let filled = adapter
        .fill_in_ipv6_header(
            &mut buffer,
            adapter.ipv6_address(),
            dst_mac,
            dst,
            Ipv6NextHeader::Icmpv6,
            len,
            hop_limit,
        )
        .is_ok()
        && buffer.payload_mut(offset).is_some_and(write);
    if !filled {
        adapter.release_packet_buffer(buffer);
        return ProcessResult::Dropped(DropReason::NoBuffer);
    }
    finish_reply(stack, adapter, adapter.send_buffer(buffer))
}

fn finish_reply(
    stack: &NetworkStack,
    adapter: &dyn NetworkAdapter,
    sent: Result<(), TxError>,
) -> ProcessResult {
    match sent {
        Ok(()) => {
            stack.stats.inc_replies_tx();
            ProcessResult::Replied
        }
        Err(e) => {
            klog!(Debug, "net: reply on {} failed: {}", adapter.name(), e);
            ProcessResult::Dropped(DropReason::NoBuffer)
        }
    }
}

// ============================================================================
// Protocol Handlers
// ============================================================================

fn handle_arp(stack: &NetworkStack, payload: &[u8]) -> ProcessResult {
    let packet = match parse_arp(payload) {
        Ok(p) => p,
        Err(e) => {
            stack.stats.inc_malformed();
            klog!(Debug, "arp: dropping packet: {}", e);
            return ProcessResult::Dropped(DropReason::Arp(e));
        }
    };
    stack.stats.inc_arp_rx();

    if !packet.sender_hw.is_zero() && !packet.sender_ip.is_unspecified() {
        stack
            .arp
            .update(packet.sender_ip, packet.sender_hw, ArpUpdate::Set);
    }

    if packet.op != ArpOp::Request {
        return ProcessResult::Handled;
    }
    let Some(owner) = stack.adapter_for_ipv4(packet.target_ip) else {
        return ProcessResult::Dropped(DropReason::NotForUs);
    };

    klog!(Debug, "arp: {} asks for {}, answering", packet.sender_ip, packet.target_ip);
    let reply = ArpPacket::reply_to(&packet, owner.mac_address(), owner.ipv4_address());
    finish_reply(
        stack,
        owner.as_ref(),
        send_arp_packet(owner.as_ref(), packet.sender_hw, &reply),
    )
}

fn handle_ipv4(stack: &NetworkStack, eth: &EthHeader, packet: &[u8], timestamp_ms: u64) -> ProcessResult {
    let (ip, payload) = match parse_ipv4(packet) {
        Ok(parsed) => parsed,
        Err(e) => {
            stack.stats.inc_malformed();
            klog!(Debug, "ipv4: dropping datagram: {}", e);
            return ProcessResult::Dropped(DropReason::Ipv4(e));
        }
    };
    stack.stats.inc_ipv4_rx();

    let for_us = stack.adapter_for_ipv4(ip.dst).is_some()
        || ip.dst.is_broadcast()
        || ip.dst.is_multicast()
        || stack.is_subnet_broadcast(ip.dst);
    if !for_us {
        klog!(Trace, "ipv4: {} is not ours", ip.dst);
        return ProcessResult::Dropped(DropReason::NotForUs);
    }

    if !eth.src.is_zero() && !eth.src.is_multicast() && !ip.src.is_unspecified() {
        let on_link = stack.adapters.read().iter().any(|a| {
            let local = a.ipv4_address();
            !local.is_unspecified() && local.same_subnet(ip.src, a.ipv4_netmask())
        });
        if on_link {
            stack.arp.update(ip.src, eth.src, ArpUpdate::Set);
        }
    }

    let datagram = &packet[..ip.total_len as usize];
    match ip.proto() {
        Some(Ipv4Proto::Icmp) => handle_icmp(stack, eth, &ip, datagram, payload, timestamp_ms),
        Some(Ipv4Proto::Udp) => handle_udp(stack, &ip, payload, timestamp_ms),
        Some(Ipv4Proto::Tcp) => handle_tcp(stack, &ip, payload, timestamp_ms),
        None => {
            klog!(Trace, "ipv4: ignoring protocol {}", ip.protocol);
            ProcessResult::Dropped(DropReason::UnsupportedProtocol)
        }
    }
}

fn handle_icmp(
    stack: &NetworkStack,
    eth: &EthHeader,
    ip: &Ipv4Header,
    datagram: &[u8],
    message: &[u8],
    timestamp_ms: u64,
) -> ProcessResult {
    let header = match parse_icmp(message) {
        Ok(h) => h,
        Err(e) => {
            stack.stats.inc_malformed();
            return ProcessResult::Dropped(DropReason::Icmp(e));
        }
    };
    stack.stats.inc_icmp_rx();

    for socket in stack.sockets.icmp_sockets() {
        socket.did_receive(ip.src, datagram, timestamp_ms);
    }

    if header.icmp_type != ICMP_TYPE_ECHO_REQUEST {
        klog!(Trace, "icmp: type {} from {} not handled", header.icmp_type, ip.src);
        return ProcessResult::Handled;
    }
    let Some(owner) = stack.adapter_for_ipv4(ip.dst) else {
        return ProcessResult::Handled;
    };

    reply_ipv4(
        stack,
        owner.as_ref(),
        eth.src,
        ip.src,
        Ipv4Proto::Icmp,
        message.len(),
        |out| write_echo_reply(out, message).is_ok(),
    )
}

fn handle_udp(stack: &NetworkStack, ip: &Ipv4Header, datagram: &[u8], timestamp_ms: u64) -> ProcessResult {
    let (udp, payload) = match parse_udp(datagram) {
        Ok(parsed) => parsed,
        Err(e) => {
            stack.stats.inc_malformed();
            klog!(Debug, "udp: dropping datagram from {}: {}", ip.src, e);
            return ProcessResult::Dropped(DropReason::Udp(e));
        }
    };
    stack.stats.inc_udp_rx();

    let Some(socket) = stack.sockets.lookup_udp(udp.dst_port) else {
        klog!(Trace, "udp: no socket on port {}", udp.dst_port);
        return ProcessResult::Dropped(DropReason::NoSocket);
    };

    let deliver = stack.adapter_for_ipv4(ip.dst).is_some()
        || ip.dst.is_broadcast()
        || stack.is_subnet_broadcast(ip.dst)
        || (ip.dst.is_multicast() && socket.is_member(ip.dst));
    if !deliver {
        klog!(Debug, "udp: port {} has not joined {}", udp.dst_port, ip.dst);
        return ProcessResult::Dropped(DropReason::Rejected);
    }

    socket.did_receive(UdpDatagram {
        src: ip.src,
        src_port: udp.src_port,
        dst: ip.dst,
        payload: payload.to_vec(),
        timestamp_ms,
    });
    ProcessResult::Handled
}

fn handle_ipv6(
    stack: &NetworkStack,
    adapter: &dyn NetworkAdapter,
    eth: &EthHeader,
    packet: &[u8],
) -> ProcessResult {
    let (ip, payload) = match parse_ipv6(packet) {
        Ok(parsed) => parsed,
        Err(e) => {
            stack.stats.inc_malformed();
            klog!(Debug, "ipv6: dropping datagram: {}", e);
            return ProcessResult::Dropped(DropReason::Ipv6(e));
        }
    };
    stack.stats.inc_ipv6_rx();

    match Ipv6NextHeader::from_raw(ip.next_header) {
        Some(Ipv6NextHeader::Icmpv6) => handle_icmpv6(stack, adapter, eth, &ip, payload),
        Some(proto @ (Ipv6NextHeader::Udp | Ipv6NextHeader::Tcp)) => {
            klog!(Debug, "ipv6: {:?} from {} not delivered", proto, ip.src);
            ProcessResult::Dropped(DropReason::UnsupportedProtocol)
        }
        None => {
            klog!(Trace, "ipv6: ignoring next header {}", ip.next_header);
            ProcessResult::Dropped(DropReason::UnsupportedProtocol)
        }
    }
}

fn handle_icmpv6(
    stack: &NetworkStack,
    adapter: &dyn NetworkAdapter,
    eth: &EthHeader,
    ip: &Ipv6Header,
    message: &[u8],
) -> ProcessResult {
    let header = match parse_icmpv6(message) {
        Ok(h) => h,
        Err(e) => {
            stack.stats.inc_malformed();
            return ProcessResult::Dropped(DropReason::Icmpv6(e));
        }
    };
    stack.stats.inc_icmpv6_rx();

    let ours = adapter.ipv6_address();
    match Icmpv6Type::from_raw(header.icmp_type) {
        Some(Icmpv6Type::EchoRequest) => {
            if ours.is_unspecified() || ip.dst != ours {
                return ProcessResult::Dropped(DropReason::NotForUs);
            }
            reply_ipv6(
                stack,
                adapter,
                eth.src,
                ip.src,
                message.len(),
                stack.config.default_hop_limit,
                |out| icmpv6::write_echo_reply(out, message, ours, ip.src).is_ok(),
            )
        }
        Some(Icmpv6Type::NeighborSolicitation) => {
            let target = match solicitation_target(message) {
                Ok(t) => t,
                Err(e) => {
                    stack.stats.inc_malformed();
                    return ProcessResult::Dropped(DropReason::Icmpv6(e));
                }
            };
            if ours.is_unspecified() || target != ours {
                return ProcessResult::Handled;
            }
            if ip.src.is_unspecified() {
                klog!(Debug, "icmpv6: duplicate address detection for {}", target);
                return ProcessResult::Handled;
            }
            reply_ipv6(
                stack,
                adapter,
                eth.src,
                ip.src,
                NEIGHBOR_ADVERTISEMENT_LEN,
                NDP_HOP_LIMIT,
                |out| write_neighbor_advertisement(out, target, adapter.mac_address(), ours, ip.src).is_ok(),
            )
        }
        other => {
            klog!(Trace, "icmpv6: {:?} (type {}) not handled", other, header.icmp_type);
            ProcessResult::Handled
        }
    }
}
