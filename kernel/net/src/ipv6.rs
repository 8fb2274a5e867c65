//! IPv6 protocol layer
//!
//! # Header Format (RFC 8200)
//!
//! ```text
//! +-------+---------------+---------------------------------------+
//! |Version| Traffic Class |              Flow Label               |
//! +-------+---------------+-------+---------------+---------------+
//! |         Payload Length        |  Next Header  |   Hop Limit   |
//! +-------------------------------+---------------+---------------+
//! |                    Source Address (128 bits)                  |
//! +---------------------------------------------------------------+
//! |                 Destination Address (128 bits)                |
//! +---------------------------------------------------------------+
//! ```
//!
//! Extension headers are not walked; the next-header field of the fixed
//! header selects the upper layer directly.

use core::fmt;

/// Fixed IPv6 header length in bytes
pub const IPV6_HEADER_LEN: usize = 40;

/// Hop limit required on Neighbor Discovery messages (RFC 4861 section 7.1)
pub const NDP_HOP_LIMIT: u8 = 255;

/// Upper-layer protocols this core dispatches on
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6NextHeader {
    Tcp = 6,
    Udp = 17,
    Icmpv6 = 58,
}

impl Ipv6NextHeader {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            6 => Some(Ipv6NextHeader::Tcp),
            17 => Some(Ipv6NextHeader::Udp),
            58 => Some(Ipv6NextHeader::Icmpv6),
            _ => None,
        }
    }

    #[inline]
    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// IPv6 Address
// ============================================================================

/// IPv6 address (16 bytes, network order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv6Addr(pub [u8; 16]);

impl Ipv6Addr {
    /// ::
    pub const UNSPECIFIED: Ipv6Addr = Ipv6Addr([0; 16]);

    /// ::1
    pub const LOCALHOST: Ipv6Addr = Ipv6Addr([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// ff02::1
    pub const LINK_LOCAL_ALL_NODES: Ipv6Addr =
        Ipv6Addr([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// Build from eight 16-bit groups.
    pub const fn new(s: [u16; 8]) -> Self {
        let mut b = [0u8; 16];
        let mut i = 0;
        while i < 8 {
            b[2 * i] = (s[i] >> 8) as u8;
            b[2 * i + 1] = s[i] as u8;
            i += 1;
        }
        Ipv6Addr(b)
    }

    #[inline]
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    /// Solicited-node multicast group (ff02::1:ffXX:XXXX) of this address.
    pub fn solicited_node(&self) -> Ipv6Addr {
        let mut b = [0u8; 16];
        b[0] = 0xff;
        b[1] = 0x02;
        b[11] = 0x01;
        b[12] = 0xff;
        b[13..16].copy_from_slice(&self.0[13..16]);
        Ipv6Addr(b)
    }
}

impl fmt::Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..8 {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:x}", u16::from_be_bytes([self.0[2 * i], self.0[2 * i + 1]]))?;
        }
        Ok(())
    }
}

// ============================================================================
// IPv6 Header
// ============================================================================

/// Parsed fixed IPv6 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    pub payload_len: u16,
    /// Raw next-header value; see [`Ipv6NextHeader::from_raw`]
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

/// Errors from IPv6 parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Ipv6Error {
    /// Fewer bytes than the fixed header or declared payload length
    #[error("truncated ipv6 datagram")]
    Truncated,
    /// Version field is not 6
    #[error("bad ipv6 version")]
    BadVersion,
}

/// Parse and validate an IPv6 datagram.
///
/// The returned payload is trimmed to the declared payload length.
pub fn parse_ipv6(packet: &[u8]) -> Result<(Ipv6Header, &[u8]), Ipv6Error> {
    if packet.len() < IPV6_HEADER_LEN {
        return Err(Ipv6Error::Truncated);
    }
    if packet[0] >> 4 != 6 {
        return Err(Ipv6Error::BadVersion);
    }

    let payload_len = u16::from_be_bytes([packet[4], packet[5]]);
    let end = IPV6_HEADER_LEN + payload_len as usize;
    if end > packet.len() {
        return Err(Ipv6Error::Truncated);
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    dst.copy_from_slice(&packet[24..40]);

    let header = Ipv6Header {
        payload_len,
        next_header: packet[6],
        hop_limit: packet[7],
        src: Ipv6Addr(src),
        dst: Ipv6Addr(dst),
    };
    Ok((header, &packet[IPV6_HEADER_LEN..end]))
}

/// Build a fixed 40-byte IPv6 header (traffic class and flow label zero).
pub fn build_ipv6_header(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: Ipv6NextHeader,
    payload_len: u16,
    hop_limit: u8,
) -> [u8; IPV6_HEADER_LEN] {
    let mut hdr = [0u8; IPV6_HEADER_LEN];
    hdr[0] = 0x60;
    hdr[4..6].copy_from_slice(&payload_len.to_be_bytes());
    hdr[6] = next_header.to_raw();
    hdr[7] = hop_limit;
    hdr[8..24].copy_from_slice(&src.0);
    hdr[24..40].copy_from_slice(&dst.0);
    hdr
}
