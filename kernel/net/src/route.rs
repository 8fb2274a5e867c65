//! Next-hop selection for outgoing IPv4 datagrams.
//!
//! [`route_to`] picks the adapter that owns the source address (or whose
//! subnet contains the destination, or that has a default gateway), then
//! resolves the next hop's link address through the ARP table. On an ARP
//! miss a request is broadcast on the chosen adapter and no route is
//! reported; the caller abandons the datagram it was building.

use alloc::sync::Arc;

use crate::adapter::{NetworkAdapter, TxError};
use crate::arp::{ArpPacket, ARP_PACKET_LEN};
use crate::ethernet::{write_ethernet_header, EthAddr, EtherType};
use crate::ipv4::{Ipv4Addr, Ipv4Proto};
use crate::stack::NetworkStack;
use crate::ETH_HEADER_SIZE;

/// Where to send a datagram.
#[derive(Clone)]
pub struct RoutingDecision {
    pub adapter: Arc<dyn NetworkAdapter>,
    /// Link address of the next hop (the destination itself when on-link)
    pub next_hop: EthAddr,
}

impl RoutingDecision {
    /// Frame `payload` in Ethernet + IPv4 headers and transmit it.
    pub fn send_ipv4(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: Ipv4Proto,
        ttl: u8,
        payload: &[u8],
    ) -> Result<(), TxError> {
        let offset = self.adapter.ipv4_payload_offset();
        let mut buffer = self
            .adapter
            .acquire_packet_buffer(offset + payload.len())
            .ok_or(TxError::NoBuffer)?;

        let filled = self.adapter.fill_in_ipv4_header(
            &mut buffer,
            src,
            self.next_hop,
            dst,
            proto,
            payload.len(),
            ttl,
        );
        let body = match filled {
            Ok(()) => buffer.payload_mut(offset),
            Err(e) => {
                self.adapter.release_packet_buffer(buffer);
                return Err(e);
            }
        };
        match body {
            Some(body) => body.copy_from_slice(payload),
            None => {
                self.adapter.release_packet_buffer(buffer);
                return Err(TxError::InvalidBuffer);
            }
        }
        self.adapter.send_buffer(buffer)
    }
}

/// Choose an adapter and next hop for `target`, preferring the adapter that
/// owns `source`.
pub fn route_to(stack: &NetworkStack, target: Ipv4Addr, source: Ipv4Addr) -> Option<RoutingDecision> {
    let adapters = stack.adapters();
    let configured = |a: &&Arc<dyn NetworkAdapter>| !a.ipv4_address().is_unspecified();

    let by_source = adapters
        .iter()
        .filter(configured)
        .find(|a| !source.is_unspecified() && a.ipv4_address() == source);
    let on_link = adapters
        .iter()
        .filter(configured)
        .find(|a| a.ipv4_address().same_subnet(target, a.ipv4_netmask()));
    let with_gateway = adapters
        .iter()
        .filter(configured)
        .find(|a| !a.ipv4_gateway().is_unspecified());

    let adapter = by_source.or(on_link).or(with_gateway).or(adapters.first())?;
    if !adapter.link_up() {
        klog!(Debug, "route_to: adapter {} is down", adapter.name());
        return None;
    }

    let local = adapter.ipv4_address();
    let netmask = adapter.ipv4_netmask();
    if target.is_broadcast() || (!local.is_unspecified() && target == local.subnet_broadcast(netmask)) {
        return Some(RoutingDecision {
            adapter: adapter.clone(),
            next_hop: EthAddr::BROADCAST,
        });
    }

    let next_hop_ip = if local.same_subnet(target, netmask) {
        target
    } else {
        let gateway = adapter.ipv4_gateway();
        if gateway.is_unspecified() {
            klog!(Debug, "route_to: {} is off-link and {} has no gateway", target, adapter.name());
            return None;
        }
        gateway
    };

    if let Some(mac) = stack.arp().lookup(next_hop_ip) {
        return Some(RoutingDecision {
            adapter: adapter.clone(),
            next_hop: mac,
        });
    }

    klog!(Debug, "route_to: no ARP entry for {}, sending request on {}", next_hop_ip, adapter.name());
    if let Err(e) = send_arp_request(adapter.as_ref(), next_hop_ip) {
        klog!(Warn, "route_to: ARP request for {} failed: {}", next_hop_ip, e);
    }
    None
}

/// Broadcast "who has `target_ip`" on `adapter`.
pub fn send_arp_request(adapter: &dyn NetworkAdapter, target_ip: Ipv4Addr) -> Result<(), TxError> {
    let request = ArpPacket::request(adapter.mac_address(), adapter.ipv4_address(), target_ip);
    send_arp_packet(adapter, EthAddr::BROADCAST, &request)
}

/// Frame `packet` and transmit it to `dst_mac`.
pub fn send_arp_packet(
    adapter: &dyn NetworkAdapter,
    dst_mac: EthAddr,
    packet: &ArpPacket,
) -> Result<(), TxError> {
    let mut buffer = adapter
        .acquire_packet_buffer(ETH_HEADER_SIZE + ARP_PACKET_LEN)
        .ok_or(TxError::NoBuffer)?;
    let frame = buffer.bytes_mut();
    if write_ethernet_header(frame, dst_mac, adapter.mac_address(), EtherType::Arp).is_err() {
        adapter.release_packet_buffer(buffer);
        return Err(TxError::InvalidBuffer);
    }
    frame[ETH_HEADER_SIZE..].copy_from_slice(&packet.to_bytes());
    adapter.send_buffer(buffer)
}
