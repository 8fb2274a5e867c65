//! Shared fixtures: a stack with one soft adapter on a manual clock, and
//! builders/parsers for the frames the tests exchange with it.

#![allow(dead_code)]

use std::sync::Arc;

use net::arp::{parse_arp, ArpPacket};
use net::ethernet::parse_ethernet;
use net::ipv4::{build_ipv4_header, parse_ipv4};
use net::ipv6::{build_ipv6_header, parse_ipv6};
use net::tcp::{build_tcp_segment, parse_tcp_header, verify_tcp_checksum, TcpOptionKind};
use net::{
    ArpUpdate, Clock, EthAddr, EthHeader, EtherType, Ipv4Addr, Ipv4Header, Ipv4Proto, Ipv6Addr,
    Ipv6Header, Ipv6NextHeader, ManualClock, NetworkStack, ProcessResult, SoftAdapter,
    SoftAdapterConfig, StackConfig, TcpConnKey, TcpHeader, TcpSocket, UdpHeader,
};

pub const LOCAL_MAC: EthAddr = EthAddr([0x02, 0, 0, 0, 0, 0x01]);
pub const PEER_MAC: EthAddr = EthAddr([0x02, 0, 0, 0, 0, 0x02]);
pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);
pub const LOCAL_IPV6: Ipv6Addr = Ipv6Addr::new([0xfe80, 0, 0, 0, 0, 0, 0, 0x10]);
pub const PEER_IPV6: Ipv6Addr = Ipv6Addr::new([0xfe80, 0, 0, 0, 0, 0, 0, 0x20]);

pub const LOCAL_PORT: u16 = 80;
pub const PEER_PORT: u16 = 40000;

pub struct Harness {
    pub stack: Arc<NetworkStack>,
    pub adapter: Arc<SoftAdapter>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    /// Stack with the peer already in the ARP table.
    pub fn new() -> Self {
        Self::with_config(StackConfig::default())
    }

    pub fn with_config(config: StackConfig) -> Self {
        let h = Self::without_arp(config);
        h.stack.arp().update(PEER_IP, PEER_MAC, ArpUpdate::Set);
        h
    }

    pub fn without_arp(config: StackConfig) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let stack = NetworkStack::new(config, clock.clone());
        let adapter = Arc::new(SoftAdapter::new(SoftAdapterConfig {
            mac: LOCAL_MAC,
            ipv4: LOCAL_IP,
            ipv6: LOCAL_IPV6,
            ..SoftAdapterConfig::default()
        }));
        stack.add_adapter(adapter.clone());
        Harness {
            stack,
            adapter,
            clock,
        }
    }

    /// Run one frame through the demultiplexer.
    pub fn deliver(&self, frame: &[u8]) -> ProcessResult {
        self.stack
            .process_frame(self.adapter.as_ref(), frame, self.clock.now_ms())
    }

    /// Frames transmitted since the last call.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.adapter.take_transmitted()
    }

    /// Active open from `local_port` to the peer's `peer_port`, completed
    /// with a SYN+ACK carrying `peer_isn`. Transmit log is cleared.
    pub fn established(&self, local_port: u16, peer_port: u16, peer_isn: u32) -> Arc<TcpSocket> {
        let socket = self
            .stack
            .tcp_connect(LOCAL_IP, local_port, PEER_IP, peer_port)
            .expect("connect");
        let our_seq = socket.lock().sequence_number;
        let frame = TcpFrame::new(peer_port, local_port)
            .flags(net::tcp::TCP_FLAG_SYN | net::tcp::TCP_FLAG_ACK)
            .seq(peer_isn)
            .ack(our_seq)
            .build();
        self.deliver(&frame);
        self.sent();
        socket
    }

    pub fn key(&self, local_port: u16, peer_port: u16) -> TcpConnKey {
        TcpConnKey::new(LOCAL_IP, local_port, PEER_IP, peer_port)
    }
}

// ============================================================================
// Frame Builders
// ============================================================================

pub fn eth_frame(dst: EthAddr, src: EthAddr, ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
    let header = EthHeader {
        dst,
        src,
        ethertype: ethertype.to_raw(),
    };
    let mut frame = header.to_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}

pub fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, proto: Ipv4Proto, payload: &[u8]) -> Vec<u8> {
    let mut datagram = build_ipv4_header(src, dst, proto, payload.len() as u16, 64).to_vec();
    datagram.extend_from_slice(payload);
    eth_frame(LOCAL_MAC, PEER_MAC, EtherType::Ipv4, &datagram)
}

pub fn ipv6_frame(src: Ipv6Addr, dst: Ipv6Addr, next: Ipv6NextHeader, payload: &[u8]) -> Vec<u8> {
    let mut datagram = build_ipv6_header(src, dst, next, payload.len() as u16, 64).to_vec();
    datagram.extend_from_slice(payload);
    eth_frame(LOCAL_MAC, PEER_MAC, EtherType::Ipv6, &datagram)
}

pub fn arp_request_frame(sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let request = ArpPacket::request(PEER_MAC, sender_ip, target_ip);
    eth_frame(EthAddr::BROADCAST, PEER_MAC, EtherType::Arp, &request.to_bytes())
}

pub fn icmp_echo_request(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![8, 0, 0, 0];
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    let sum = net::checksum::internet_checksum(&msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
    msg
}

pub fn udp_frame(dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let header = UdpHeader {
        src_port,
        dst_port,
        length: (8 + payload.len()) as u16,
        checksum: 0,
    };
    let mut datagram = header.to_bytes().to_vec();
    datagram.extend_from_slice(payload);
    ipv4_frame(PEER_IP, dst, Ipv4Proto::Udp, &datagram)
}

/// Builder for segments sent by the peer.
pub struct TcpFrame {
    src_port: u16,
    dst_port: u16,
    dst_ip: Ipv4Addr,
    flags: u8,
    seq: u32,
    ack: u32,
    payload: Vec<u8>,
    options: Vec<TcpOptionKind>,
}

impl TcpFrame {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        TcpFrame {
            src_port,
            dst_port,
            dst_ip: LOCAL_IP,
            flags: 0,
            seq: 0,
            ack: 0,
            payload: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn to_ip(mut self, ip: Ipv4Addr) -> Self {
        self.dst_ip = ip;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn option(mut self, option: TcpOptionKind) -> Self {
        self.options.push(option);
        self
    }

    pub fn segment(&self) -> Vec<u8> {
        let header = TcpHeader::new(self.src_port, self.dst_port, self.seq, self.ack, self.flags, 8192);
        build_tcp_segment(PEER_IP, self.dst_ip, &header, &self.options, &self.payload)
    }

    pub fn build(&self) -> Vec<u8> {
        ipv4_frame(PEER_IP, self.dst_ip, Ipv4Proto::Tcp, &self.segment())
    }
}

// ============================================================================
// Parsers for Transmitted Frames
// ============================================================================

pub fn parse_sent_ipv4(frame: &[u8]) -> (EthHeader, Ipv4Header, Vec<u8>) {
    let (eth, payload) = parse_ethernet(frame).expect("ethernet");
    assert_eq!(eth.ethertype, EtherType::Ipv4.to_raw());
    let (ip, body) = parse_ipv4(payload).expect("ipv4 header with valid checksum");
    (eth, ip, body.to_vec())
}

pub fn parse_sent_ipv6(frame: &[u8]) -> (EthHeader, Ipv6Header, Vec<u8>) {
    let (eth, payload) = parse_ethernet(frame).expect("ethernet");
    assert_eq!(eth.ethertype, EtherType::Ipv6.to_raw());
    let (ip, body) = parse_ipv6(payload).expect("ipv6");
    (eth, ip, body.to_vec())
}

pub fn parse_sent_arp(frame: &[u8]) -> (EthHeader, ArpPacket) {
    let (eth, payload) = parse_ethernet(frame).expect("ethernet");
    assert_eq!(eth.ethertype, EtherType::Arp.to_raw());
    (eth, parse_arp(payload).expect("arp"))
}

/// Parse a transmitted TCP segment, asserting its checksum verifies.
pub fn parse_sent_tcp(frame: &[u8]) -> (TcpHeader, Vec<u8>) {
    let (_, ip, segment) = parse_sent_ipv4(frame);
    assert_eq!(ip.protocol, Ipv4Proto::Tcp.to_raw());
    assert!(
        verify_tcp_checksum(ip.src, ip.dst, &segment),
        "tcp checksum must verify"
    );
    let header = parse_tcp_header(&segment).expect("tcp header");
    let payload = segment[header.header_len()..].to_vec();
    (header, payload)
}
