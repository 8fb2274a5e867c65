//! IPv4 protocol layer
//!
//! # Header Format (RFC 791)
//!
//! ```text
//! +-------+-------+---------------+-------------------------------+
//! |Version|  IHL  |   DSCP/ECN    |          Total Length         |
//! +-------+-------+---------------+-------------------------------+
//! |         Identification        |Flags|     Fragment Offset     |
//! +---------------+---------------+-------------------------------+
//! |      TTL      |   Protocol    |        Header Checksum        |
//! +---------------+---------------+-------------------------------+
//! |                        Source Address                         |
//! +---------------------------------------------------------------+
//! |                     Destination Address                       |
//! +---------------------------------------------------------------+
//! ```
//!
//! Inbound datagrams must satisfy `header_len <= total_len <= frame bytes`;
//! anything else is rejected before transport-layer interpretation.
//!
//! # References
//! - RFC 791: Internet Protocol

use core::fmt;

use crate::checksum::internet_checksum;

/// Minimum IPv4 header length in bytes (IHL == 5)
pub const IPV4_HEADER_MIN_LEN: usize = 20;

/// Maximum IPv4 header length in bytes (IHL == 15)
pub const IPV4_HEADER_MAX_LEN: usize = 60;

// ============================================================================
// IPv4 Protocol Numbers
// ============================================================================

/// Transport protocols this core dispatches on
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Proto {
    /// ICMP (Internet Control Message Protocol)
    Icmp = 1,
    /// TCP (Transmission Control Protocol)
    Tcp = 6,
    /// UDP (User Datagram Protocol)
    Udp = 17,
}

impl Ipv4Proto {
    /// Try to convert from raw protocol number
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            1 => Some(Ipv4Proto::Icmp),
            6 => Some(Ipv4Proto::Tcp),
            17 => Some(Ipv4Proto::Udp),
            _ => None,
        }
    }

    /// Get raw protocol number
    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// IPv4 Address
// ============================================================================

/// IPv4 address (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// Create from 4 octets
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    /// All zeros (0.0.0.0)
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

    /// Broadcast (255.255.255.255)
    pub const BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

    /// Check if this is a multicast address (224.0.0.0/4)
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    #[inline]
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    #[inline]
    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    #[inline]
    pub fn from_u32(v: u32) -> Self {
        Ipv4Addr(v.to_be_bytes())
    }

    /// `true` when both addresses fall in the same subnet under `netmask`.
    #[inline]
    pub fn same_subnet(self, other: Ipv4Addr, netmask: Ipv4Addr) -> bool {
        let mask = netmask.to_u32();
        self.to_u32() & mask == other.to_u32() & mask
    }

    /// Directed broadcast address of this address' subnet.
    #[inline]
    pub fn subnet_broadcast(self, netmask: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr::from_u32(self.to_u32() | !netmask.to_u32())
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

// ============================================================================
// IPv4 Header
// ============================================================================

/// Parsed IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in 32-bit words
    pub ihl: u8,
    /// Total length (header + payload)
    pub total_len: u16,
    pub ttl: u8,
    /// Raw protocol number; see [`Ipv4Proto::from_raw`]
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Header length in bytes
    #[inline]
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// Payload length in bytes
    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len())
    }

    #[inline]
    pub fn proto(&self) -> Option<Ipv4Proto> {
        Ipv4Proto::from_raw(self.protocol)
    }
}

/// Errors from IPv4 parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Ipv4Error {
    /// Fewer bytes than the header or declared total length
    #[error("truncated ipv4 datagram")]
    Truncated,
    /// Version field is not 4
    #[error("bad ipv4 version")]
    BadVersion,
    /// IHL below 5
    #[error("bad ipv4 header length")]
    BadIhl,
    /// Total length smaller than the header
    #[error("bad ipv4 total length")]
    BadTotalLen,
    /// Header checksum does not verify
    #[error("ipv4 header checksum mismatch")]
    ChecksumMismatch,
}

/// Parse and validate an IPv4 datagram.
///
/// Returns the header and the payload trimmed to the declared total length
/// (link-layer padding is discarded).
pub fn parse_ipv4(packet: &[u8]) -> Result<(Ipv4Header, &[u8]), Ipv4Error> {
    if packet.len() < IPV4_HEADER_MIN_LEN {
        return Err(Ipv4Error::Truncated);
    }

    let version = packet[0] >> 4;
    let ihl = packet[0] & 0x0f;
    if version != 4 {
        return Err(Ipv4Error::BadVersion);
    }
    if ihl < 5 {
        return Err(Ipv4Error::BadIhl);
    }

    let header_len = (ihl as usize) * 4;
    if header_len > packet.len() {
        return Err(Ipv4Error::Truncated);
    }

    let total_len = u16::from_be_bytes([packet[2], packet[3]]);
    if (total_len as usize) < header_len {
        return Err(Ipv4Error::BadTotalLen);
    }
    if (total_len as usize) > packet.len() {
        return Err(Ipv4Error::Truncated);
    }

    if internet_checksum(&packet[..header_len]) != 0 {
        return Err(Ipv4Error::ChecksumMismatch);
    }

    let header = Ipv4Header {
        ihl,
        total_len,
        ttl: packet[8],
        protocol: packet[9],
        src: Ipv4Addr([packet[12], packet[13], packet[14], packet[15]]),
        dst: Ipv4Addr([packet[16], packet[17], packet[18], packet[19]]),
    };
    Ok((header, &packet[header_len..total_len as usize]))
}

/// Build a 20-byte IPv4 header with a valid checksum.
pub fn build_ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: Ipv4Proto,
    payload_len: u16,
    ttl: u8,
) -> [u8; IPV4_HEADER_MIN_LEN] {
    let total_len = (IPV4_HEADER_MIN_LEN as u16).saturating_add(payload_len);
    let mut hdr = [0u8; IPV4_HEADER_MIN_LEN];

    // Version (4) + IHL (5)
    hdr[0] = 0x45;
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    // Don't Fragment
    hdr[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    hdr[8] = ttl;
    hdr[9] = proto.to_raw();
    hdr[12..16].copy_from_slice(&src.0);
    hdr[16..20].copy_from_slice(&dst.0);

    let checksum = internet_checksum(&hdr);
    hdr[10..12].copy_from_slice(&checksum.to_be_bytes());
    hdr
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn datagram(payload: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&build_ipv4_header(
            Ipv4Addr::new(192, 168, 1, 2),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Proto::Udp,
            payload.len() as u16,
            64,
        ));
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn test_parse_built_header() {
        let pkt = datagram(&[1, 2, 3, 4]);
        let (hdr, payload) = parse_ipv4(&pkt).unwrap();
        assert_eq!(hdr.src, Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(hdr.dst, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hdr.proto(), Some(Ipv4Proto::Udp));
        assert_eq!(hdr.ttl, 64);
        assert_eq!(payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_padding_trimmed() {
        let mut pkt = datagram(&[9, 9]);
        pkt.extend_from_slice(&[0; 6]);
        let (_, payload) = parse_ipv4(&pkt).unwrap();
        assert_eq!(payload, &[9, 9]);
    }

    #[test]
    fn test_length_validation() {
        let pkt = datagram(&[0; 8]);
        assert_eq!(parse_ipv4(&pkt[..19]), Err(Ipv4Error::Truncated));
        // Declared total length exceeds the bytes we have.
        assert_eq!(parse_ipv4(&pkt[..24]), Err(Ipv4Error::Truncated));

        let mut short_total = datagram(&[]);
        short_total[2..4].copy_from_slice(&10u16.to_be_bytes());
        assert_eq!(parse_ipv4(&short_total), Err(Ipv4Error::BadTotalLen));
    }

    #[test]
    fn test_bad_version_and_checksum() {
        let mut pkt = datagram(&[]);
        pkt[0] = 0x65;
        assert_eq!(parse_ipv4(&pkt), Err(Ipv4Error::BadVersion));

        let mut pkt = datagram(&[]);
        pkt[8] = 1;
        assert_eq!(parse_ipv4(&pkt), Err(Ipv4Error::ChecksumMismatch));
    }

    #[test]
    fn test_subnet_helpers() {
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        let a = Ipv4Addr::new(10, 0, 2, 15);
        assert!(a.same_subnet(Ipv4Addr::new(10, 0, 2, 2), mask));
        assert!(!a.same_subnet(Ipv4Addr::new(10, 0, 3, 2), mask));
        assert_eq!(a.subnet_broadcast(mask), Ipv4Addr::new(10, 0, 2, 255));
        assert!(Ipv4Addr::new(224, 0, 0, 251).is_multicast());
    }
}
