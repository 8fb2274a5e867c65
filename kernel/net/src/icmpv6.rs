//! ICMPv6 echo and Neighbor Discovery
//!
//! Neighbor Advertisement as sent in reply to a solicitation (RFC 4861
//! section 4.4):
//!
//! ```text
//! +---------------+---------------+-------------------------------+
//! |   Type (136)  |    Code (0)   |           Checksum            |
//! +-+-+-+---------+---------------+-------------------------------+
//! |R|S|O|                     Reserved                            |
//! +-+-+-+---------------------------------------------------------+
//! |                  Target Address (128 bits)                    |
//! +---------------+---------------+-------------------------------+
//! |   Type (2)    |  Length (1)   |   Link-Layer Address (6) ...  |
//! +---------------+---------------+-------------------------------+
//! ```
//!
//! All checksums cover the IPv6 pseudo-header.
//!
//! # References
//! - RFC 4443: ICMPv6
//! - RFC 4861: Neighbor Discovery for IPv6

use crate::checksum::ipv6_pseudo_checksum;
use crate::ethernet::EthAddr;
use crate::ipv6::{Ipv6Addr, Ipv6NextHeader};

pub const ICMPV6_TYPE_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_TYPE_ECHO_REPLY: u8 = 129;
pub const ICMPV6_TYPE_NEIGHBOR_SOLICITATION: u8 = 135;
pub const ICMPV6_TYPE_NEIGHBOR_ADVERTISEMENT: u8 = 136;

pub const ICMPV6_HEADER_LEN: usize = 4;
pub const ICMPV6_ECHO_HEADER_LEN: usize = 8;

/// Solicitation body: header, reserved word, target address
pub const NEIGHBOR_SOLICITATION_MIN_LEN: usize = 24;

/// Advertisement with one target link-layer address option
pub const NEIGHBOR_ADVERTISEMENT_LEN: usize = 32;

/// Solicited (S) and Override (O) flags
pub const NA_FLAGS_SOLICITED_OVERRIDE: u32 = 0x6000_0000;

/// Target Link-Layer Address option type
pub const NDP_OPTION_TARGET_LINK_ADDR: u8 = 2;

/// Message kinds this core reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Icmpv6Type {
    EchoRequest,
    EchoReply,
    NeighborSolicitation,
    NeighborAdvertisement,
}

impl Icmpv6Type {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            ICMPV6_TYPE_ECHO_REQUEST => Some(Icmpv6Type::EchoRequest),
            ICMPV6_TYPE_ECHO_REPLY => Some(Icmpv6Type::EchoReply),
            ICMPV6_TYPE_NEIGHBOR_SOLICITATION => Some(Icmpv6Type::NeighborSolicitation),
            ICMPV6_TYPE_NEIGHBOR_ADVERTISEMENT => Some(Icmpv6Type::NeighborAdvertisement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Icmpv6Header {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Icmpv6Error {
    #[error("truncated icmpv6 message")]
    Truncated,
    #[error("output buffer too small for icmpv6 reply")]
    BufferTooSmall,
}

pub fn parse_icmpv6(data: &[u8]) -> Result<Icmpv6Header, Icmpv6Error> {
    if data.len() < ICMPV6_HEADER_LEN {
        return Err(Icmpv6Error::Truncated);
    }
    Ok(Icmpv6Header {
        icmp_type: data[0],
        code: data[1],
        checksum: u16::from_be_bytes([data[2], data[3]]),
    })
}

/// Target address of a Neighbor Solicitation.
pub fn solicitation_target(data: &[u8]) -> Result<Ipv6Addr, Icmpv6Error> {
    if data.len() < NEIGHBOR_SOLICITATION_MIN_LEN {
        return Err(Icmpv6Error::Truncated);
    }
    let mut target = [0u8; 16];
    target.copy_from_slice(&data[8..24]);
    Ok(Ipv6Addr(target))
}

fn finish_checksum(msg: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr) {
    msg[2] = 0;
    msg[3] = 0;
    let checksum = ipv6_pseudo_checksum(src, dst, Ipv6NextHeader::Icmpv6.to_raw(), msg);
    msg[2..4].copy_from_slice(&checksum.to_be_bytes());
}

/// Write the Echo Reply for `request` into `out`.
///
/// `src`/`dst` are the addresses of the reply datagram.
pub fn write_echo_reply(
    out: &mut [u8],
    request: &[u8],
    src: Ipv6Addr,
    dst: Ipv6Addr,
) -> Result<usize, Icmpv6Error> {
    if request.len() < ICMPV6_ECHO_HEADER_LEN {
        return Err(Icmpv6Error::Truncated);
    }
    let reply = out
        .get_mut(..request.len())
        .ok_or(Icmpv6Error::BufferTooSmall)?;

    reply.copy_from_slice(request);
    reply[0] = ICMPV6_TYPE_ECHO_REPLY;
    reply[1] = 0;
    finish_checksum(reply, src, dst);
    Ok(request.len())
}

/// Write a solicited Neighbor Advertisement for `target` owned by `mac`.
pub fn write_neighbor_advertisement(
    out: &mut [u8],
    target: Ipv6Addr,
    mac: EthAddr,
    src: Ipv6Addr,
    dst: Ipv6Addr,
) -> Result<usize, Icmpv6Error> {
    let msg = out
        .get_mut(..NEIGHBOR_ADVERTISEMENT_LEN)
        .ok_or(Icmpv6Error::BufferTooSmall)?;

    msg.fill(0);
    msg[0] = ICMPV6_TYPE_NEIGHBOR_ADVERTISEMENT;
    msg[4..8].copy_from_slice(&NA_FLAGS_SOLICITED_OVERRIDE.to_be_bytes());
    msg[8..24].copy_from_slice(&target.0);
    msg[24] = NDP_OPTION_TARGET_LINK_ADDR;
    // Option length in units of 8 bytes
    msg[25] = 1;
    msg[26..32].copy_from_slice(&mac.0);
    finish_checksum(msg, src, dst);
    Ok(NEIGHBOR_ADVERTISEMENT_LEN)
}
