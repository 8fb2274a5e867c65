//! Network adapter interface consumed by the packet-processing core.
//!
//! Drivers implement [`NetworkAdapter`]; the core never touches descriptor
//! rings, DMA or link management. It only needs to:
//!
//! 1. **Receive**: copy one queued frame into a caller-supplied scratch
//!    buffer together with its receive timestamp.
//!
//! 2. **Transmit**: borrow an outgoing [`PacketBuffer`] of a given size, have
//!    the link and network headers filled in, write the transport payload at
//!    the payload offset, and hand the finished frame back.
//!
//! 3. **Describe itself**: link address, IPv4/IPv6 configuration and MTU.
//!
//! # Thread Safety
//!
//! Adapters are shared between the worker and application threads (a TCP
//! send from an application thread transmits directly), so implementations
//! must be `Send + Sync` and synchronize internally.

use alloc::vec;
use alloc::vec::Vec;

use crate::ethernet::{write_ethernet_header, EthAddr, EtherType};
use crate::ipv4::{build_ipv4_header, Ipv4Addr, Ipv4Proto, IPV4_HEADER_MIN_LEN};
use crate::ipv6::{build_ipv6_header, Ipv6Addr, Ipv6NextHeader, IPV6_HEADER_LEN};
use crate::{DEFAULT_MTU, ETH_HEADER_SIZE};

// ============================================================================
// Error Types
// ============================================================================

/// Errors from building or transmitting an outgoing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    /// No adapter/next hop for the destination (includes ARP misses).
    #[error("no route to host")]
    NoRoute,
    /// The adapter had no packet buffer to lend.
    #[error("no packet buffer available")]
    NoBuffer,
    /// No descriptors available in the TX queue (try again later).
    #[error("transmit queue full")]
    QueueFull,
    /// Device link is down or TX queue is stopped.
    #[error("link down")]
    LinkDown,
    /// Buffer is invalid (too small for the headers, too large, ...).
    #[error("invalid packet buffer")]
    InvalidBuffer,
    /// Device encountered an I/O or bus error.
    #[error("device i/o error")]
    IoError,
}

// ============================================================================
// Packet Buffer
// ============================================================================

/// Outgoing frame storage lent by an adapter.
///
/// The buffer is exactly as long as requested and starts zeroed.
#[derive(Debug)]
pub struct PacketBuffer {
    data: Vec<u8>,
}

impl PacketBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
        }
    }

    /// Re-use existing storage, resized and zeroed.
    pub fn from_storage(mut storage: Vec<u8>, size: usize) -> Self {
        storage.clear();
        storage.resize(size, 0);
        Self { data: storage }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Everything from `offset` on, or `None` if the buffer is shorter.
    pub fn payload_mut(&mut self, offset: usize) -> Option<&mut [u8]> {
        self.data.get_mut(offset..)
    }

    pub fn into_storage(self) -> Vec<u8> {
        self.data
    }
}

// ============================================================================
// NetworkAdapter Trait
// ============================================================================

/// A network interface as seen by the packet-processing core.
pub trait NetworkAdapter: Send + Sync {
    // ========================================================================
    // Identity & Configuration
    // ========================================================================

    /// Interface name (e.g., "eth0").
    fn name(&self) -> &str;

    fn mac_address(&self) -> EthAddr;

    /// Configured IPv4 address, `0.0.0.0` if none.
    fn ipv4_address(&self) -> Ipv4Addr;

    fn ipv4_netmask(&self) -> Ipv4Addr;

    /// Default gateway, `0.0.0.0` if none.
    fn ipv4_gateway(&self) -> Ipv4Addr;

    /// Configured IPv6 address, `::` if none.
    fn ipv6_address(&self) -> Ipv6Addr;

    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }

    fn link_up(&self) -> bool {
        true
    }

    /// Offset of the IPv4 payload inside an outgoing frame.
    fn ipv4_payload_offset(&self) -> usize {
        ETH_HEADER_SIZE + IPV4_HEADER_MIN_LEN
    }

    /// Offset of the IPv6 payload inside an outgoing frame.
    fn ipv6_payload_offset(&self) -> usize {
        ETH_HEADER_SIZE + IPV6_HEADER_LEN
    }

    // ========================================================================
    // Data Path - Receive
    // ========================================================================

    fn has_queued_packets(&self) -> bool;

    /// Copy the oldest queued frame into `buf`.
    ///
    /// Returns the frame length and its receive timestamp in milliseconds,
    /// or `None` if nothing is queued. Frames longer than `buf` are
    /// truncated to `buf.len()`.
    fn dequeue_packet(&self, buf: &mut [u8]) -> Option<(usize, u64)>;

    // ========================================================================
    // Data Path - Transmit
    // ========================================================================

    /// Borrow a zeroed buffer of exactly `size` bytes, `None` when exhausted.
    fn acquire_packet_buffer(&self, size: usize) -> Option<PacketBuffer>;

    /// Return a buffer obtained from [`acquire_packet_buffer`](Self::acquire_packet_buffer).
    fn release_packet_buffer(&self, buffer: PacketBuffer);

    /// Transmit a complete link-layer frame.
    fn send_packet(&self, frame: &[u8]) -> Result<(), TxError>;

    /// Transmit `buffer` and give it back to the adapter.
    fn send_buffer(&self, buffer: PacketBuffer) -> Result<(), TxError> {
        let result = self.send_packet(buffer.bytes());
        self.release_packet_buffer(buffer);
        result
    }

    /// Write Ethernet and IPv4 headers for a datagram carrying
    /// `payload_len` bytes of `proto`.
    #[allow(clippy::too_many_arguments)]
    fn fill_in_ipv4_header(
        &self,
        buffer: &mut PacketBuffer,
        src: Ipv4Addr,
        dst_mac: EthAddr,
        dst: Ipv4Addr,
        proto: Ipv4Proto,
        payload_len: usize,
        ttl: u8,
    ) -> Result<(), TxError> {
        let payload_len = u16::try_from(payload_len).map_err(|_| TxError::InvalidBuffer)?;
        let frame = buffer.bytes_mut();
        if frame.len() < ETH_HEADER_SIZE + IPV4_HEADER_MIN_LEN {
            return Err(TxError::InvalidBuffer);
        }
        write_ethernet_header(frame, dst_mac, self.mac_address(), EtherType::Ipv4)
            .map_err(|_| TxError::InvalidBuffer)?;
        frame[ETH_HEADER_SIZE..ETH_HEADER_SIZE + IPV4_HEADER_MIN_LEN]
            .copy_from_slice(&build_ipv4_header(src, dst, proto, payload_len, ttl));
        Ok(())
    }

    /// Write Ethernet and IPv6 headers for a datagram carrying
    /// `payload_len` bytes of `next_header`.
    #[allow(clippy::too_many_arguments)]
    fn fill_in_ipv6_header(
        &self,
        buffer: &mut PacketBuffer,
        src: Ipv6Addr,
        dst_mac: EthAddr,
        dst: Ipv6Addr,
        next_header: Ipv6NextHeader,
        payload_len: usize,
        hop_limit: u8,
    ) -> Result<(), TxError> {
        let payload_len = u16::try_from(payload_len).map_err(|_| TxError::InvalidBuffer)?;
        let frame = buffer.bytes_mut();
        if frame.len() < ETH_HEADER_SIZE + IPV6_HEADER_LEN {
            return Err(TxError::InvalidBuffer);
        }
        write_ethernet_header(frame, dst_mac, self.mac_address(), EtherType::Ipv6)
            .map_err(|_| TxError::InvalidBuffer)?;
        frame[ETH_HEADER_SIZE..ETH_HEADER_SIZE + IPV6_HEADER_LEN].copy_from_slice(
            &build_ipv6_header(src, dst, next_header, payload_len, hop_limit),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_buffer_reuse_is_zeroed() {
        let mut buf = PacketBuffer::new(8);
        buf.bytes_mut().fill(0xaa);
        let reused = PacketBuffer::from_storage(buf.into_storage(), 12);
        assert_eq!(reused.len(), 12);
        assert!(reused.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_payload_offset_slice() {
        let mut buf = PacketBuffer::new(40);
        assert_eq!(buf.payload_mut(34).map(|p| p.len()), Some(6));
        assert!(buf.payload_mut(41).is_none());
    }
}
