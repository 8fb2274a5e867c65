//! Ethernet II framing
//!
//! ```text
//! +-------------------+-------------------+-----------+-------------
//! | Destination (6)   | Source (6)        | Type (2)  | Payload ...
//! +-------------------+-------------------+-----------+-------------
//! ```
//!
//! Frames are never re-interpreted in place: [`parse_ethernet`] checks the
//! length once and returns a copied header plus a borrowed payload slice.

use core::fmt;

use crate::ETH_HEADER_SIZE;

// ============================================================================
// Link Addresses
// ============================================================================

/// 48-bit MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    /// 00:00:00:00:00:00
    pub const ZERO: EthAddr = EthAddr([0; 6]);

    /// ff:ff:ff:ff:ff:ff
    pub const BROADCAST: EthAddr = EthAddr([0xff; 6]);

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit of the first octet.
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

// ============================================================================
// EtherType
// ============================================================================

/// EtherType values this core dispatches on
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
    Ipv6 = 0x86DD,
}

impl EtherType {
    /// Map a raw type field, `None` for anything this core does not handle.
    pub fn from_raw(v: u16) -> Option<Self> {
        match v {
            0x0800 => Some(EtherType::Ipv4),
            0x0806 => Some(EtherType::Arp),
            0x86DD => Some(EtherType::Ipv6),
            _ => None,
        }
    }

    #[inline]
    pub fn to_raw(self) -> u16 {
        self as u16
    }
}

// ============================================================================
// Header
// ============================================================================

/// Parsed Ethernet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: EthAddr,
    pub src: EthAddr,
    /// Raw type field; see [`EtherType::from_raw`].
    pub ethertype: u16,
}

impl EthHeader {
    pub fn to_bytes(&self) -> [u8; ETH_HEADER_SIZE] {
        let mut bytes = [0u8; ETH_HEADER_SIZE];
        bytes[0..6].copy_from_slice(&self.dst.0);
        bytes[6..12].copy_from_slice(&self.src.0);
        bytes[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        bytes
    }
}

/// Errors from Ethernet framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EthError {
    /// Frame shorter than the 14-byte header
    #[error("frame shorter than an ethernet header")]
    Truncated,
    /// Destination buffer too small for the header
    #[error("buffer too small for an ethernet header")]
    BufferTooSmall,
}

/// Split a frame into its header and payload.
pub fn parse_ethernet(frame: &[u8]) -> Result<(EthHeader, &[u8]), EthError> {
    if frame.len() < ETH_HEADER_SIZE {
        return Err(EthError::Truncated);
    }

    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);

    let header = EthHeader {
        dst: EthAddr(dst),
        src: EthAddr(src),
        ethertype: u16::from_be_bytes([frame[12], frame[13]]),
    };
    Ok((header, &frame[ETH_HEADER_SIZE..]))
}

/// Write an Ethernet header at the front of `buf`.
pub fn write_ethernet_header(
    buf: &mut [u8],
    dst: EthAddr,
    src: EthAddr,
    ethertype: EtherType,
) -> Result<(), EthError> {
    let out = buf
        .get_mut(..ETH_HEADER_SIZE)
        .ok_or(EthError::BufferTooSmall)?;
    let header = EthHeader {
        dst,
        src,
        ethertype: ethertype.to_raw(),
    };
    out.copy_from_slice(&header.to_bytes());
    Ok(())
}
