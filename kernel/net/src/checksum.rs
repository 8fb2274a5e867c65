//! Internet checksum (RFC 1071) and transport pseudo-header sums.
//!
//! Every reply this core synthesizes (IPv4 headers, ICMP echo replies,
//! ICMPv6 messages, TCP segments) is checksummed through these helpers, and
//! inbound IPv4 headers and TCP segments are verified with them.
//!
//! # Pseudo-headers
//!
//! ```text
//! IPv4 (RFC 793 / 768)                 IPv6 (RFC 8200 section 8.1)
//! +-------------------------------+    +-------------------------------+
//! |        Source Address         |    |   Source Address (16 bytes)   |
//! +-------------------------------+    +-------------------------------+
//! |      Destination Address      |    | Destination Address (16 bytes)|
//! +-------+-------+---------------+    +-------------------------------+
//! | zero  | proto |  TCP/UDP len  |    |   Upper-Layer Length (32 bit) |
//! +-------+-------+---------------+    +-----------------------+-------+
//!                                      |        zero           | next  |
//!                                      +-----------------------+-------+
//! ```

use crate::ipv4::Ipv4Addr;
use crate::ipv6::Ipv6Addr;

/// Add the 16-bit big-endian words of `data` to a running 32-bit sum.
///
/// An odd trailing byte is padded with zero on the right.
#[inline]
pub fn checksum_accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold a 32-bit sum into 16 bits and return its one's complement.
#[inline]
pub fn checksum_finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum over `data`.
///
/// Computing this over a buffer that already holds a correct checksum
/// yields zero.
#[inline]
pub fn internet_checksum(data: &[u8]) -> u16 {
    checksum_finish(checksum_accumulate(0, data))
}

/// Checksum of a TCP/UDP segment including the IPv4 pseudo-header.
pub fn ipv4_pseudo_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, data: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.0);
    pseudo[4..8].copy_from_slice(&dst.0);
    pseudo[9] = proto;
    pseudo[10..12].copy_from_slice(&(data.len() as u16).to_be_bytes());

    let sum = checksum_accumulate(0, &pseudo);
    checksum_finish(checksum_accumulate(sum, data))
}

/// Checksum of an upper-layer message including the IPv6 pseudo-header.
pub fn ipv6_pseudo_checksum(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, data: &[u8]) -> u16 {
    let mut pseudo = [0u8; 40];
    pseudo[0..16].copy_from_slice(&src.0);
    pseudo[16..32].copy_from_slice(&dst.0);
    pseudo[32..36].copy_from_slice(&(data.len() as u32).to_be_bytes());
    pseudo[39] = next_header;

    let sum = checksum_accumulate(0, &pseudo);
    checksum_finish(checksum_accumulate(sum, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1071_example() {
        // Sample from RFC 1071 section 3: sum is 0xddf2, checksum is its complement.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn test_odd_length_padding() {
        assert_eq!(internet_checksum(&[0xab]), !0xab00);
        assert_eq!(
            internet_checksum(&[0x12, 0x34, 0x56]),
            checksum_finish(0x1234 + 0x5600)
        );
    }

    #[test]
    fn test_checksum_over_checksummed_buffer_is_zero() {
        let mut data = [0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34];
        let sum = internet_checksum(&data);
        data[6..8].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(internet_checksum(&data), 0);
    }

    #[test]
    fn test_pseudo_checksum_verifies() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut segment = [0u8; 12];
        segment[0] = 0x30;
        segment[11] = 0x7f;
        let sum = ipv4_pseudo_checksum(src, dst, 17, &segment);
        segment[6..8].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(ipv4_pseudo_checksum(src, dst, 17, &segment), 0);

        let src6 = Ipv6Addr::LINK_LOCAL_ALL_NODES;
        let dst6 = Ipv6Addr::LOCALHOST;
        let mut msg = [0x80u8, 0, 0, 0, 0, 1, 0, 7];
        let sum = ipv6_pseudo_checksum(src6, dst6, 58, &msg);
        msg[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(ipv6_pseudo_checksum(src6, dst6, 58, &msg), 0);
    }
}
