//! Software adapter backed by in-memory queues.
//!
//! The host side injects inbound frames with [`SoftAdapter::inject`] and
//! collects transmitted frames with [`SoftAdapter::take_transmitted`]. It is
//! used to bridge the core to tap-like endpoints and to drive the stack
//! deterministically in tests.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::adapter::{NetworkAdapter, PacketBuffer, TxError};
use crate::ethernet::EthAddr;
use crate::ipv4::Ipv4Addr;
use crate::ipv6::Ipv6Addr;
use crate::DEFAULT_MTU;

/// Inbound frames kept before new ones are dropped
pub const SOFT_ADAPTER_RX_QUEUE_LEN: usize = 256;

/// Static configuration of a [`SoftAdapter`].
#[derive(Debug, Clone)]
pub struct SoftAdapterConfig {
    pub name: String,
    pub mac: EthAddr,
    pub ipv4: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub mtu: usize,
}

impl Default for SoftAdapterConfig {
    fn default() -> Self {
        SoftAdapterConfig {
            name: String::from("soft0"),
            mac: EthAddr([0x02, 0, 0, 0, 0, 0x01]),
            ipv4: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::UNSPECIFIED,
            ipv6: Ipv6Addr::UNSPECIFIED,
            mtu: DEFAULT_MTU,
        }
    }
}

/// In-memory [`NetworkAdapter`].
#[derive(Debug)]
pub struct SoftAdapter {
    config: SoftAdapterConfig,
    rx_queue: Mutex<VecDeque<(Vec<u8>, u64)>>,
    tx_log: Mutex<Vec<Vec<u8>>>,
    free_buffers: Mutex<Vec<Vec<u8>>>,
    buffers_available: AtomicBool,
    link_up: AtomicBool,
    rx_dropped: AtomicU64,
}

impl SoftAdapter {
    pub fn new(config: SoftAdapterConfig) -> Self {
        SoftAdapter {
            config,
            rx_queue: Mutex::new(VecDeque::new()),
            tx_log: Mutex::new(Vec::new()),
            free_buffers: Mutex::new(Vec::new()),
            buffers_available: AtomicBool::new(true),
            link_up: AtomicBool::new(true),
            rx_dropped: AtomicU64::new(0),
        }
    }

    /// Queue an inbound frame. Returns `false` if the queue is full.
    pub fn inject(&self, frame: &[u8], timestamp_ms: u64) -> bool {
        let mut queue = self.rx_queue.lock();
        if queue.len() >= SOFT_ADAPTER_RX_QUEUE_LEN {
            self.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back((frame.to_vec(), timestamp_ms));
        true
    }

    /// Drain every frame transmitted so far.
    pub fn take_transmitted(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.tx_log.lock())
    }

    pub fn transmitted_count(&self) -> usize {
        self.tx_log.lock().len()
    }

    pub fn rx_queue_len(&self) -> usize {
        self.rx_queue.lock().len()
    }

    pub fn rx_dropped(&self) -> u64 {
        self.rx_dropped.load(Ordering::Relaxed)
    }

    /// Simulate buffer exhaustion.
    pub fn set_buffers_available(&self, available: bool) {
        self.buffers_available.store(available, Ordering::Release);
    }

    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::Release);
    }
}

impl NetworkAdapter for SoftAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn mac_address(&self) -> EthAddr {
        self.config.mac
    }

    fn ipv4_address(&self) -> Ipv4Addr {
        self.config.ipv4
    }

    fn ipv4_netmask(&self) -> Ipv4Addr {
        self.config.netmask
    }

    fn ipv4_gateway(&self) -> Ipv4Addr {
        self.config.gateway
    }

    fn ipv6_address(&self) -> Ipv6Addr {
        self.config.ipv6
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    fn has_queued_packets(&self) -> bool {
        !self.rx_queue.lock().is_empty()
    }

    fn dequeue_packet(&self, buf: &mut [u8]) -> Option<(usize, u64)> {
        let (frame, timestamp) = self.rx_queue.lock().pop_front()?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Some((len, timestamp))
    }

    fn acquire_packet_buffer(&self, size: usize) -> Option<PacketBuffer> {
        if !self.buffers_available.load(Ordering::Acquire) {
            return None;
        }
        let storage = self.free_buffers.lock().pop();
        Some(match storage {
            Some(storage) => PacketBuffer::from_storage(storage, size),
            None => PacketBuffer::new(size),
        })
    }

    fn release_packet_buffer(&self, buffer: PacketBuffer) {
        self.free_buffers.lock().push(buffer.into_storage());
    }

    fn send_packet(&self, frame: &[u8]) -> Result<(), TxError> {
        if !self.link_up() {
            return Err(TxError::LinkDown);
        }
        self.tx_log.lock().push(frame.to_vec());
        Ok(())
    }
}
