//! ICMPv4 echo handling
//!
//! ```text
//! +---------------+---------------+-------------------------------+
//! |     Type      |     Code      |           Checksum            |
//! +---------------+---------------+-------------------------------+
//! |          Identifier           |        Sequence Number        |
//! +-------------------------------+-------------------------------+
//! |                          Payload ...                          |
//! ```
//!
//! # References
//! - RFC 792: Internet Control Message Protocol

use crate::checksum::internet_checksum;

/// Echo Reply type
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
/// Echo Request type
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// Type + code + checksum
pub const ICMP_HEADER_LEN: usize = 4;
/// Echo header including identifier and sequence
pub const ICMP_ECHO_HEADER_LEN: usize = 8;

/// Common ICMP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IcmpError {
    #[error("truncated icmp message")]
    Truncated,
    #[error("output buffer too small for icmp reply")]
    BufferTooSmall,
}

pub fn parse_icmp(data: &[u8]) -> Result<IcmpHeader, IcmpError> {
    if data.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated);
    }
    Ok(IcmpHeader {
        icmp_type: data[0],
        code: data[1],
        checksum: u16::from_be_bytes([data[2], data[3]]),
    })
}

/// Identifier and sequence number of an echo message.
pub fn echo_id_seq(data: &[u8]) -> Result<(u16, u16), IcmpError> {
    if data.len() < ICMP_ECHO_HEADER_LEN {
        return Err(IcmpError::Truncated);
    }
    Ok((
        u16::from_be_bytes([data[4], data[5]]),
        u16::from_be_bytes([data[6], data[7]]),
    ))
}

/// Write the Echo Reply for `request` into `out`.
///
/// Identifier, sequence number and payload are preserved; the checksum is
/// recomputed. Returns the reply length, which equals `request.len()`.
pub fn write_echo_reply(out: &mut [u8], request: &[u8]) -> Result<usize, IcmpError> {
    if request.len() < ICMP_ECHO_HEADER_LEN {
        return Err(IcmpError::Truncated);
    }
    let reply = out
        .get_mut(..request.len())
        .ok_or(IcmpError::BufferTooSmall)?;

    reply.copy_from_slice(request);
    reply[0] = ICMP_TYPE_ECHO_REPLY;
    reply[1] = 0;
    reply[2] = 0;
    reply[3] = 0;
    let checksum = internet_checksum(reply);
    reply[2..4].copy_from_slice(&checksum.to_be_bytes());
    Ok(request.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_request(payload: &[u8]) -> alloc::vec::Vec<u8> {
        let mut req = alloc::vec![ICMP_TYPE_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0x00, 0x07];
        req.extend_from_slice(payload);
        let sum = internet_checksum(&req);
        req[2..4].copy_from_slice(&sum.to_be_bytes());
        req
    }

    #[test]
    fn test_echo_reply_preserves_fields() {
        let req = echo_request(b"abcdefgh");
        let mut out = [0u8; 64];
        let len = write_echo_reply(&mut out, &req).unwrap();
        let reply = &out[..len];

        let hdr = parse_icmp(reply).unwrap();
        assert_eq!(hdr.icmp_type, ICMP_TYPE_ECHO_REPLY);
        assert_eq!(hdr.code, 0);
        assert_eq!(echo_id_seq(reply).unwrap(), (0x1234, 7));
        assert_eq!(&reply[8..], b"abcdefgh");
        assert_eq!(internet_checksum(reply), 0);
    }

    #[test]
    fn test_short_request_and_buffer() {
        let mut out = [0u8; 4];
        assert_eq!(write_echo_reply(&mut out, &[8, 0, 0, 0, 0, 0]), Err(IcmpError::Truncated));
        let req = echo_request(&[]);
        assert_eq!(write_echo_reply(&mut out, &req), Err(IcmpError::BufferTooSmall));
        assert_eq!(parse_icmp(&[0, 0]), Err(IcmpError::Truncated));
    }
}
