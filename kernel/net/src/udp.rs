//! UDP (User Datagram Protocol)
//!
//! # Packet Format (RFC 768)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |            Length             |           Checksum            |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                             Data                              |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! Only header validation lives here; demultiplexing by port happens in
//! the stack against the socket table.
//!
//! # References
//!
//! - RFC 768: User Datagram Protocol

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// Parsed UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header + payload length
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }
}

/// Errors from UDP parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UdpError {
    /// Fewer than 8 bytes, or fewer bytes than the length field claims
    #[error("truncated udp datagram")]
    Truncated,
    /// Length field smaller than the header
    #[error("bad udp length field")]
    BadLength,
}

/// Parse a UDP datagram, returning the header and the payload trimmed to
/// the length field.
pub fn parse_udp(data: &[u8]) -> Result<(UdpHeader, &[u8]), UdpError> {
    if data.len() < UDP_HEADER_LEN {
        return Err(UdpError::Truncated);
    }

    let header = UdpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        length: u16::from_be_bytes([data[4], data[5]]),
        checksum: u16::from_be_bytes([data[6], data[7]]),
    };

    let length = header.length as usize;
    if length < UDP_HEADER_LEN {
        return Err(UdpError::BadLength);
    }
    if length > data.len() {
        return Err(UdpError::Truncated);
    }
    Ok((header, &data[UDP_HEADER_LEN..length]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp() {
        let hdr = UdpHeader {
            src_port: 5353,
            dst_port: 53,
            length: 11,
            checksum: 0,
        };
        let mut dgram = [0u8; 12];
        dgram[..8].copy_from_slice(&hdr.to_bytes());
        dgram[8..11].copy_from_slice(b"abc");

        let (parsed, payload) = parse_udp(&dgram).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_udp_length_checks() {
        assert_eq!(parse_udp(&[0u8; 7]), Err(UdpError::Truncated));

        let mut dgram = [0u8; 8];
        dgram[5] = 4;
        assert_eq!(parse_udp(&dgram), Err(UdpError::BadLength));

        dgram[5] = 20;
        assert_eq!(parse_udp(&dgram), Err(UdpError::Truncated));
    }
}
