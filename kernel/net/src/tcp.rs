//! TCP (Transmission Control Protocol) wire format
//!
//! Header parsing, option handling, checksums and segment construction.
//! The per-segment state machine lives in [`crate::tcp_input`]; connection
//! objects live in [`crate::socket`].
//!
//! # TCP Header Format (RFC 793)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                        Sequence Number                        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                     Acknowledgment Number                     |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Data  |       |C|E|U|A|P|R|S|F|                               |
//! | Offs  | Resv  |W|C|R|C|S|S|Y|I|            Window             |
//! |       |       |R|E|G|K|H|T|N|N|                               |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |           Checksum            |         Urgent Pointer        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Options (if data offset > 5)               |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                             Data                              |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! State names follow RFC 793; the transitions this core implements are
//! drawn in [`crate::tcp_input`].
//!
//! # References
//!
//! - RFC 793: Transmission Control Protocol
//! - RFC 1122: Requirements for Internet Hosts
//! - RFC 7323: TCP Extensions for High Performance (window scale)

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::checksum::ipv4_pseudo_checksum;
use crate::ipv4::{Ipv4Addr, Ipv4Proto};

// ============================================================================
// TCP Constants
// ============================================================================

/// TCP header minimum length in bytes (without options)
pub const TCP_HEADER_MIN_LEN: usize = 20;

/// TCP header maximum length in bytes (with max options)
pub const TCP_HEADER_MAX_LEN: usize = 60;

/// Largest advertised (unscaled) window
pub const TCP_DEFAULT_WINDOW: u16 = 65535;

/// Maximum window scale shift count (RFC 7323 Section 2.3)
pub const TCP_MAX_WINDOW_SCALE: u8 = 14;

/// Maximum connections waiting on one listener (handshaking or unaccepted)
pub const TCP_MAX_ACCEPT_BACKLOG: usize = 128;

/// Per-connection receive buffer
pub const TCP_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// IPv4 + TCP header bytes subtracted from the MTU to get the MSS
pub const TCP_IPV4_OVERHEAD: usize = 40;

// ============================================================================
// TCP Flags
// ============================================================================

/// FIN flag - sender has finished sending
pub const TCP_FLAG_FIN: u8 = 0x01;
/// SYN flag - synchronize sequence numbers
pub const TCP_FLAG_SYN: u8 = 0x02;
/// RST flag - reset the connection
pub const TCP_FLAG_RST: u8 = 0x04;
/// PSH flag - push function
pub const TCP_FLAG_PSH: u8 = 0x08;
/// ACK flag - acknowledgment field is significant
pub const TCP_FLAG_ACK: u8 = 0x10;
/// URG flag - urgent pointer field is significant
pub const TCP_FLAG_URG: u8 = 0x20;

/// Flags that select a state-machine transition
const TCP_CONTROL_FLAGS: u8 = TCP_FLAG_FIN | TCP_FLAG_SYN | TCP_FLAG_RST | TCP_FLAG_ACK;

// ============================================================================
// TCP State Machine
// ============================================================================

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    #[default]
    Closed,
    /// Passive socket; spawns a child per SYN
    Listen,
    /// Our SYN is out
    SynSent,
    /// SYN+ACK exchanged, waiting for the final ACK
    SynReceived,
    Established,
    /// Our FIN is out and unacknowledged
    FinWait1,
    /// Our FIN is acknowledged, waiting for the peer's
    FinWait2,
    /// Peer closed; the application still may send
    CloseWait,
    /// Both FINs crossed
    Closing,
    /// Our FIN after the peer's, waiting for its ACK
    LastAck,
    /// Any further segment is answered with RST
    TimeWait,
}

impl TcpState {
    /// States in which application data may still be sent.
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }
}

/// Control-flag combination of a segment, ignoring PSH/URG/ECN bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpSegmentKind {
    /// No control flags at all
    Bare,
    Syn,
    SynAck,
    Ack,
    Fin,
    FinAck,
    Rst,
    RstAck,
    /// Any other combination (SYN+FIN, SYN+RST, ...)
    Other,
}

impl TcpSegmentKind {
    pub fn from_flags(flags: u8) -> Self {
        const SYN_ACK: u8 = TCP_FLAG_SYN | TCP_FLAG_ACK;
        const FIN_ACK: u8 = TCP_FLAG_FIN | TCP_FLAG_ACK;
        const RST_ACK: u8 = TCP_FLAG_RST | TCP_FLAG_ACK;

        match flags & TCP_CONTROL_FLAGS {
            0 => TcpSegmentKind::Bare,
            TCP_FLAG_SYN => TcpSegmentKind::Syn,
            SYN_ACK => TcpSegmentKind::SynAck,
            TCP_FLAG_ACK => TcpSegmentKind::Ack,
            TCP_FLAG_FIN => TcpSegmentKind::Fin,
            FIN_ACK => TcpSegmentKind::FinAck,
            TCP_FLAG_RST => TcpSegmentKind::Rst,
            RST_ACK => TcpSegmentKind::RstAck,
            _ => TcpSegmentKind::Other,
        }
    }
}

// ============================================================================
// TCP Header
// ============================================================================

/// Parsed TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq_num: u32,
    /// Acknowledgment number (valid if ACK flag set)
    pub ack_num: u32,
    /// Data offset in 32-bit words (5-15)
    pub data_offset: u8,
    /// Control flags (FIN, SYN, RST, PSH, ACK, URG, ECE, CWR)
    pub flags: u8,
    /// Receive window size
    pub window: u16,
    /// Checksum
    pub checksum: u16,
    /// Urgent pointer (valid if URG flag set)
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Create a new TCP header with the given parameters
    pub fn new(
        src_port: u16,
        dst_port: u16,
        seq_num: u32,
        ack_num: u32,
        flags: u8,
        window: u16,
    ) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            data_offset: 5, // No options, 20 bytes
            flags,
            window,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }

    pub fn kind(&self) -> TcpSegmentKind {
        TcpSegmentKind::from_flags(self.flags)
    }

    /// Serialize header to bytes (without options)
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_MIN_LEN] {
        let mut bytes = [0u8; TCP_HEADER_MIN_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_num.to_be_bytes());
        bytes[12] = self.data_offset << 4;
        bytes[13] = self.flags;
        bytes[14..16].copy_from_slice(&self.window.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        bytes
    }
}

// ============================================================================
// TCP Options
// ============================================================================

/// TCP options this core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOptionKind {
    /// End of option list
    EndOfList,
    /// No-operation (padding)
    Nop,
    /// Maximum Segment Size
    Mss(u16),
    /// Window Scale (RFC 7323)
    WindowScale(u8),
}

/// Serialize options, terminated and zero-padded to a 32-bit boundary.
pub fn serialize_tcp_options(options: &[TcpOptionKind]) -> Vec<u8> {
    if options.is_empty() {
        return Vec::new();
    }

    let mut bytes = Vec::with_capacity(8);
    for opt in options {
        match *opt {
            TcpOptionKind::EndOfList => break,
            TcpOptionKind::Nop => bytes.push(1),
            TcpOptionKind::Mss(mss) => {
                bytes.extend_from_slice(&[2, 4]);
                bytes.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOptionKind::WindowScale(shift) => bytes.extend_from_slice(&[3, 3, shift]),
        }
    }

    if bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
}

/// Window-scale shift announced in the options of `segment`, capped at
/// [`TCP_MAX_WINDOW_SCALE`].
///
/// Options whose kind/length do not match (kind 3 must have length 3) or
/// that run past the header end stop the scan.
pub fn parse_window_scale(segment: &[u8], header: &TcpHeader) -> Option<u8> {
    let header_len = header.header_len();
    if header_len <= TCP_HEADER_MIN_LEN || segment.len() < header_len {
        return None;
    }

    let opts = &segment[TCP_HEADER_MIN_LEN..header_len];
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            3 => {
                if i + 3 <= opts.len() && opts[i + 1] == 3 {
                    return Some(opts[i + 2].min(TCP_MAX_WINDOW_SCALE));
                }
                break;
            }
            _ => {
                let Some(&len) = opts.get(i + 1) else { break };
                if len < 2 {
                    break;
                }
                i += len as usize;
            }
        }
    }
    None
}

// ============================================================================
// Connection Key
// ============================================================================

/// Four-tuple identifying one connection, seen from this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TcpConnKey {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

impl TcpConnKey {
    pub fn new(local_ip: Ipv4Addr, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Self {
        Self {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
        }
    }

    /// Key of a listener bound to `local_ip:local_port`.
    pub fn listener(local_ip: Ipv4Addr, local_port: u16) -> Self {
        Self::new(local_ip, local_port, Ipv4Addr::UNSPECIFIED, 0)
    }
}

impl fmt::Display for TcpConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

// ============================================================================
// TCP Errors
// ============================================================================

/// Errors that can occur while parsing a TCP segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TcpError {
    /// Segment shorter than its header
    #[error("truncated tcp segment")]
    Truncated,
    /// Data offset below 5 words
    #[error("bad tcp data offset")]
    InvalidHeaderLen,
    /// Checksum verification failed
    #[error("tcp checksum mismatch")]
    BadChecksum,
}

// ============================================================================
// Parsing and Construction
// ============================================================================

/// Parse TCP header from raw bytes
///
/// Validates that the data offset is at least 5 and that the header fits in
/// `data`. Does NOT verify the checksum.
pub fn parse_tcp_header(data: &[u8]) -> Result<TcpHeader, TcpError> {
    if data.len() < TCP_HEADER_MIN_LEN {
        return Err(TcpError::Truncated);
    }

    let data_offset = data[12] >> 4;
    if data_offset < 5 {
        return Err(TcpError::InvalidHeaderLen);
    }
    if data.len() < (data_offset as usize) * 4 {
        return Err(TcpError::Truncated);
    }

    Ok(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13],
        window: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// Compute TCP checksum using IPv4 pseudo-header
pub fn compute_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_data: &[u8]) -> u16 {
    ipv4_pseudo_checksum(src_ip, dst_ip, Ipv4Proto::Tcp.to_raw(), tcp_data)
}

/// `true` if the checksum embedded in `tcp_data` verifies.
pub fn verify_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_data: &[u8]) -> bool {
    compute_tcp_checksum(src_ip, dst_ip, tcp_data) == 0
}

/// Build a complete, checksummed TCP segment.
///
/// Options are serialized and padded, and the data offset reflects them.
pub fn build_tcp_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    header: &TcpHeader,
    options: &[TcpOptionKind],
    payload: &[u8],
) -> Vec<u8> {
    let options_bytes = serialize_tcp_options(options);
    let header_len = TCP_HEADER_MIN_LEN + options_bytes.len();
    debug_assert!(header_len <= TCP_HEADER_MAX_LEN);

    let mut hdr = *header;
    hdr.data_offset = (header_len / 4) as u8;
    hdr.checksum = 0;

    let mut segment = vec![0u8; header_len + payload.len()];
    segment[..TCP_HEADER_MIN_LEN].copy_from_slice(&hdr.to_bytes());
    segment[TCP_HEADER_MIN_LEN..header_len].copy_from_slice(&options_bytes);
    segment[header_len..].copy_from_slice(payload);

    let checksum = compute_tcp_checksum(src_ip, dst_ip, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
    segment
}

// ============================================================================
// Sequence Space
// ============================================================================

/// `a` is at or before `b` in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn test_tcp_header_parsing() {
        // SYN packet
        let syn = [
            0x00, 0x50, // src port 80
            0x1F, 0x90, // dst port 8080
            0x00, 0x00, 0x00, 0x01, // seq 1
            0x00, 0x00, 0x00, 0x00, // ack 0
            0x50, // data offset 5 (20 bytes)
            0x02, // SYN flag
            0xFF, 0xFF, // window 65535
            0x00, 0x00, // checksum (placeholder)
            0x00, 0x00, // urgent ptr
        ];

        let header = parse_tcp_header(&syn).unwrap();
        assert_eq!(header.src_port, 80);
        assert_eq!(header.dst_port, 8080);
        assert_eq!(header.seq_num, 1);
        assert_eq!(header.ack_num, 0);
        assert!(header.is_syn());
        assert!(!header.is_ack());
        assert_eq!(header.kind(), TcpSegmentKind::Syn);
    }

    #[test]
    fn test_header_length_validation() {
        let mut seg = [0u8; 24];
        seg[12] = 0x40;
        assert_eq!(parse_tcp_header(&seg), Err(TcpError::InvalidHeaderLen));
        seg[12] = 0x70; // 28-byte header in a 24-byte segment
        assert_eq!(parse_tcp_header(&seg), Err(TcpError::Truncated));
        assert_eq!(parse_tcp_header(&seg[..19]), Err(TcpError::Truncated));
    }

    #[test]
    fn test_segment_kind_ignores_psh() {
        let kind = TcpSegmentKind::from_flags;
        assert_eq!(kind(TCP_FLAG_ACK | TCP_FLAG_PSH), TcpSegmentKind::Ack);
        assert_eq!(kind(TCP_FLAG_FIN | TCP_FLAG_ACK | TCP_FLAG_PSH), TcpSegmentKind::FinAck);
        assert_eq!(kind(TCP_FLAG_RST | TCP_FLAG_ACK), TcpSegmentKind::RstAck);
        assert_eq!(kind(TCP_FLAG_SYN | TCP_FLAG_FIN), TcpSegmentKind::Other);
        assert_eq!(kind(TCP_FLAG_URG), TcpSegmentKind::Bare);
    }

    #[test]
    fn test_build_segment_with_options() {
        let hdr = TcpHeader::new(1234, 80, 1000, 0, TCP_FLAG_SYN, TCP_DEFAULT_WINDOW);
        let seg = build_tcp_segment(
            SRC,
            DST,
            &hdr,
            &[TcpOptionKind::Mss(1460), TcpOptionKind::WindowScale(7)],
            &[],
        );
        // 4 (MSS) + 3 (WS) + end + padding = 8
        assert_eq!(seg.len(), 28);
        assert!(verify_tcp_checksum(SRC, DST, &seg));

        let parsed = parse_tcp_header(&seg).unwrap();
        assert_eq!(parsed.header_len(), 28);
        assert_eq!(parse_window_scale(&seg, &parsed), Some(7));
    }

    #[test]
    fn test_window_scale_capped_and_validated() {
        let hdr = TcpHeader::new(1, 2, 0, 0, TCP_FLAG_SYN, 0);
        let seg = build_tcp_segment(SRC, DST, &hdr, &[TcpOptionKind::Nop, TcpOptionKind::WindowScale(20)], &[]);
        let parsed = parse_tcp_header(&seg).unwrap();
        assert_eq!(parse_window_scale(&seg, &parsed), Some(TCP_MAX_WINDOW_SCALE));

        // Kind 3 with a bogus length is rejected.
        let mut bad = seg.clone();
        bad[22] = 4;
        assert_eq!(parse_window_scale(&bad, &parsed), None);

        let plain = build_tcp_segment(SRC, DST, &hdr, &[], &[]);
        assert_eq!(parse_window_scale(&plain, &parse_tcp_header(&plain).unwrap()), None);
    }

    #[test]
    fn test_checksum_covers_payload() {
        let hdr = TcpHeader::new(5000, 80, 7, 9, TCP_FLAG_ACK | TCP_FLAG_PSH, 1024);
        let mut seg = build_tcp_segment(SRC, DST, &hdr, &[], b"hello");
        assert!(verify_tcp_checksum(SRC, DST, &seg));
        seg[22] ^= 0xff;
        assert!(!verify_tcp_checksum(SRC, DST, &seg));
    }

    #[test]
    fn test_seq_le_wraps() {
        assert!(seq_le(100, 100));
        assert!(seq_le(100, 200));
        assert!(!seq_le(200, 100));
        assert!(seq_le(0xFFFF_FFF0, 5));
    }

    #[test]
    fn test_can_send() {
        assert!(!TcpState::Closed.can_send());
        assert!(!TcpState::SynSent.can_send());
        assert!(TcpState::Established.can_send());
        assert!(TcpState::CloseWait.can_send());
        assert!(!TcpState::FinWait1.can_send());
    }
}
