//! ARP (Address Resolution Protocol)
//!
//! # Packet Format (RFC 826)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Hardware Type         |         Protocol Type         |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |  HLen |  PLen |            Operation (1=Req, 2=Reply)         |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Sender Hardware Address (6 bytes)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Sender Protocol Address (4 bytes)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Target Hardware Address (6 bytes)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Target Protocol Address (4 bytes)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! The table is updated opportunistically from any frame whose sender
//! information is non-zero. Updates use the `Set` policy: an existing
//! mapping is overwritten unconditionally.
//!
//! # References
//!
//! - RFC 826: Ethernet Address Resolution Protocol

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;

use crate::ethernet::EthAddr;
use crate::ipv4::Ipv4Addr;

// ============================================================================
// ARP Constants (RFC 826)
// ============================================================================

/// Hardware type: Ethernet
pub const HTYPE_ETHERNET: u16 = 1;

/// Protocol type: IPv4
pub const PTYPE_IPV4: u16 = 0x0800;

/// Hardware address length: Ethernet MAC (6 bytes)
pub const HLEN_ETHERNET: u8 = 6;

/// Protocol address length: IPv4 (4 bytes)
pub const PLEN_IPV4: u8 = 4;

/// ARP packet length for Ethernet/IPv4
pub const ARP_PACKET_LEN: usize = 28;

// ============================================================================
// ARP Packet
// ============================================================================

/// ARP operation codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    /// Who has `target_ip`?
    Request = 1,
    /// `sender_ip` is at `sender_hw`
    Reply = 2,
}

impl ArpOp {
    pub fn from_raw(v: u16) -> Option<Self> {
        match v {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }

    #[inline]
    pub fn to_raw(self) -> u16 {
        self as u16
    }
}

/// Parsed Ethernet/IPv4 ARP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_hw: EthAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: EthAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Request asking who owns `target_ip`.
    pub fn request(our_mac: EthAddr, our_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        ArpPacket {
            op: ArpOp::Request,
            sender_hw: our_mac,
            sender_ip: our_ip,
            target_hw: EthAddr::ZERO,
            target_ip,
        }
    }

    /// Answer to `request` announcing `our_mac` for `our_ip`.
    pub fn reply_to(request: &ArpPacket, our_mac: EthAddr, our_ip: Ipv4Addr) -> Self {
        ArpPacket {
            op: ArpOp::Reply,
            sender_hw: our_mac,
            sender_ip: our_ip,
            target_hw: request.sender_hw,
            target_ip: request.sender_ip,
        }
    }

    /// Serialize to the 28-byte wire format.
    pub fn to_bytes(&self) -> [u8; ARP_PACKET_LEN] {
        let mut buf = [0u8; ARP_PACKET_LEN];
        buf[0..2].copy_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        buf[2..4].copy_from_slice(&PTYPE_IPV4.to_be_bytes());
        buf[4] = HLEN_ETHERNET;
        buf[5] = PLEN_IPV4;
        buf[6..8].copy_from_slice(&self.op.to_raw().to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_hw.0);
        buf[14..18].copy_from_slice(&self.sender_ip.0);
        buf[18..24].copy_from_slice(&self.target_hw.0);
        buf[24..28].copy_from_slice(&self.target_ip.0);
        buf
    }
}

/// ARP parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArpError {
    #[error("truncated arp packet")]
    Truncated,
    #[error("arp hardware type is not ethernet")]
    InvalidHardwareType,
    #[error("arp protocol type is not ipv4")]
    InvalidProtocolType,
    #[error("bad arp address length")]
    InvalidAddressLength,
    #[error("unknown arp opcode")]
    InvalidOpcode,
}

/// Parse an ARP packet.
///
/// Zero sender fields are accepted here (ARP probes use them); the caller
/// decides whether the sender is worth learning.
pub fn parse_arp(buf: &[u8]) -> Result<ArpPacket, ArpError> {
    if buf.len() < ARP_PACKET_LEN {
        return Err(ArpError::Truncated);
    }

    if u16::from_be_bytes([buf[0], buf[1]]) != HTYPE_ETHERNET {
        return Err(ArpError::InvalidHardwareType);
    }
    if u16::from_be_bytes([buf[2], buf[3]]) != PTYPE_IPV4 {
        return Err(ArpError::InvalidProtocolType);
    }
    if buf[4] != HLEN_ETHERNET || buf[5] != PLEN_IPV4 {
        return Err(ArpError::InvalidAddressLength);
    }
    let op = ArpOp::from_raw(u16::from_be_bytes([buf[6], buf[7]])).ok_or(ArpError::InvalidOpcode)?;

    let mut sender_hw = [0u8; 6];
    let mut target_hw = [0u8; 6];
    sender_hw.copy_from_slice(&buf[8..14]);
    target_hw.copy_from_slice(&buf[18..24]);

    Ok(ArpPacket {
        op,
        sender_hw: EthAddr(sender_hw),
        sender_ip: Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]),
        target_hw: EthAddr(target_hw),
        target_ip: Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]),
    })
}

// ============================================================================
// ARP Table
// ============================================================================

/// How [`ArpCache::update`] treats the mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpUpdate {
    /// Insert or unconditionally overwrite
    Set,
    /// Remove the mapping for the address
    Delete,
}

/// IPv4 → MAC table shared by the worker and the routing code.
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: RwLock<BTreeMap<Ipv4Addr, EthAddr>>,
    updates: AtomicU64,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, ip: Ipv4Addr, mac: EthAddr, policy: ArpUpdate) {
        let mut entries = self.entries.write();
        match policy {
            ArpUpdate::Set => {
                entries.insert(ip, mac);
            }
            ArpUpdate::Delete => {
                entries.remove(&ip);
            }
        }
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<EthAddr> {
        self.entries.read().get(&ip).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of `update` calls so far.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}
