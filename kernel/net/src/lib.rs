//! Single-worker network core
//!
//! This crate receives raw link-layer frames from network adapters,
//! demultiplexes them through Ethernet, ARP/IPv4/IPv6 and ICMP/ICMPv6/UDP/TCP,
//! and drives the TCP connection state machine including delayed-ACK
//! coalescing, periodic retransmission and reset generation.
//!
//! # Architecture
//!
//! ```text
//!     +-----------------+      notify_frame_received()
//!     | NetworkAdapter  | -----------------------------+
//!     +--------+--------+                              |
//!              | dequeue_packet()                      v
//!     +--------v--------------------------------------------+
//!     | NetworkTask (one worker thread)                     |
//!     |   flush delayed ACKs -> retransmit pass -> wait/poll|
//!     +--------+--------------------------------------------+
//!              |
//!     +--------v--------+
//!     |    Ethernet     |
//!     +---+----+----+---+
//!         |    |    |
//!       ARP  IPv4  IPv6
//!              |      \
//!      ICMP  UDP  TCP  ICMPv6
//! ```
//!
//! All shared state (adapters, ARP table, socket table, delayed-ACK set,
//! retransmission registry) is owned by one [`NetworkStack`] value which is
//! passed to every handler.
//!
//! Protocol code only needs `core` and `alloc`. The worker thread, its timed
//! wait and the monotonic clock use `std`.

#![no_std]

extern crate alloc;
extern crate std;
#[macro_use]
extern crate klog;

pub mod adapter;
pub mod arp;
pub mod checksum;
pub mod delayed_ack;
pub mod ethernet;
pub mod icmp;
pub mod icmpv6;
pub mod ipv4;
pub mod ipv6;
pub mod retransmit;
pub mod route;
pub mod soft_adapter;
pub mod socket;
pub mod stack;
pub mod task;
pub mod tcp;
pub mod tcp_input;
pub mod time;
pub mod udp;
pub mod wait;

pub use adapter::{NetworkAdapter, PacketBuffer, TxError};
pub use arp::{ArpCache, ArpError, ArpOp, ArpPacket, ArpUpdate};
pub use delayed_ack::DelayedAckSet;
pub use ethernet::{EthAddr, EthError, EthHeader, EtherType};
pub use icmp::IcmpError;
pub use icmpv6::Icmpv6Error;
pub use ipv4::{Ipv4Addr, Ipv4Error, Ipv4Header, Ipv4Proto};
pub use ipv6::{Ipv6Addr, Ipv6Error, Ipv6Header, Ipv6NextHeader};
pub use retransmit::RetransmitRegistry;
pub use route::{route_to, RoutingDecision};
pub use soft_adapter::{SoftAdapter, SoftAdapterConfig};
pub use socket::{
    Direction, IcmpSocket, SocketError, SocketTable, TcpConnectError, TcpControl, TcpSocket,
    UdpDatagram, UdpSocket,
};
pub use stack::{DropReason, NetStats, NetworkStack, ProcessResult, StackConfig};
pub use task::{NetworkTask, TaskError};
pub use tcp::{TcpConnKey, TcpError, TcpHeader, TcpSegmentKind, TcpState};
pub use time::{Clock, ManualClock, MonotonicClock};
pub use udp::{UdpError, UdpHeader};

// ============================================================================
// Network Constants
// ============================================================================

/// Default Maximum Transmission Unit for Ethernet payloads.
pub const DEFAULT_MTU: usize = 1500;

/// Ethernet header size (6 dst + 6 src + 2 ethertype).
pub const ETH_HEADER_SIZE: usize = 14;

/// Maximum Ethernet frame size (excluding FCS, including header).
pub const ETH_MAX_FRAME_SIZE: usize = 1514;
