// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Routines for generating guest frames and their VXLAN encapsulation.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::ArpOperation;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::ArpRepr;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::Icmpv4Repr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Address;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use smoltcp::wire::UdpPacket;
use smoltcp::wire::UdpRepr;
use std::net::Ipv4Addr;
use tunnel_api::VXLAN_PORT;
use tunnel_api::Vni;

pub const VXLAN_HDR_LEN: usize = 8;

/// The VXLAN "I" flag: the VNI field is valid.
const VXLAN_FLAG_VNI: u8 = 0x08;

/// An endpoint on either the underlay or a tenant network.
#[derive(Clone, Copy, Debug)]
pub struct Endpoint {
    pub mac: [u8; 6],
    pub ip: Ipv4Addr,
}

impl Endpoint {
    pub const fn new(mac: [u8; 6], ip: Ipv4Addr) -> Self {
        Self { mac, ip }
    }
}

fn v4(ip: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&ip.octets())
}

/// Emit an Ethernet + IPv4 frame whose L4 payload is filled in by `body`.
fn ipv4_frame(
    src: &Endpoint,
    dst: &Endpoint,
    proto: IpProtocol,
    payload_len: usize,
    body: impl FnOnce(&mut [u8]),
) -> Vec<u8> {
    let eth = EthernetRepr {
        src_addr: EthernetAddress(src.mac),
        dst_addr: EthernetAddress(dst.mac),
        ethertype: EthernetProtocol::Ipv4,
    };
    let ip = Ipv4Repr {
        src_addr: v4(src.ip),
        dst_addr: v4(dst.ip),
        next_header: proto,
        payload_len,
        hop_limit: 64,
    };

    let mut buf =
        vec![0u8; eth.buffer_len() + ip.buffer_len() + ip.payload_len];
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.emit(&mut frame);
    let mut pkt = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip.emit(&mut pkt, &ChecksumCapabilities::default());
    body(pkt.payload_mut());
    buf
}

/// An ICMPv4 echo request from `src` to `dst`.
pub fn gen_icmpv4_echo_req(
    src: &Endpoint,
    dst: &Endpoint,
    ident: u16,
    seq_no: u16,
    data: &[u8],
) -> Vec<u8> {
    let icmp = Icmpv4Repr::EchoRequest { ident, seq_no, data };
    ipv4_frame(src, dst, IpProtocol::Icmp, icmp.buffer_len(), |buf| {
        let mut pkt = Icmpv4Packet::new_unchecked(buf);
        icmp.emit(&mut pkt, &ChecksumCapabilities::default());
    })
}

/// A broadcast ARP request from `src` asking for `target`.
pub fn gen_arp_req(src: &Endpoint, target: Ipv4Addr) -> Vec<u8> {
    let eth = EthernetRepr {
        src_addr: EthernetAddress(src.mac),
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };
    let arp = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(src.mac),
        source_protocol_addr: v4(src.ip),
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: v4(target),
    };

    let mut buf = vec![0u8; eth.buffer_len() + arp.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.emit(&mut frame);
    let mut pkt = ArpPacket::new_unchecked(frame.payload_mut());
    arp.emit(&mut pkt);
    buf
}

/// Wrap `inner` in VXLAN with `vni`, carried over UDP between two tunnel
/// endpoints.
pub fn encap(
    src: &Endpoint,
    dst: &Endpoint,
    src_port: u16,
    vni: Vni,
    inner: &[u8],
) -> Vec<u8> {
    let udp = UdpRepr { src_port, dst_port: VXLAN_PORT };
    let payload_len = VXLAN_HDR_LEN + inner.len();

    let mut vxlan = [0u8; VXLAN_HDR_LEN];
    vxlan[0] = VXLAN_FLAG_VNI;
    vxlan[4..7].copy_from_slice(&vni.bytes());

    let src_ip = IpAddress::Ipv4(v4(src.ip));
    let dst_ip = IpAddress::Ipv4(v4(dst.ip));
    let len = udp.header_len() + payload_len;
    ipv4_frame(src, dst, IpProtocol::Udp, len, |buf| {
        let mut pkt = UdpPacket::new_unchecked(buf);
        udp.emit(
            &mut pkt,
            &src_ip,
            &dst_ip,
            payload_len,
            |payload| {
                payload[..VXLAN_HDR_LEN].copy_from_slice(&vxlan);
                payload[VXLAN_HDR_LEN..].copy_from_slice(inner);
            },
            &ChecksumCapabilities::default(),
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Endpoint =
        Endpoint::new([0xfa, 0x16, 0x3e, 0, 0, 1], Ipv4Addr::new(10, 0, 0, 3));
    const B: Endpoint =
        Endpoint::new([0xfa, 0x16, 0x3e, 0, 0, 2], Ipv4Addr::new(10, 0, 0, 4));
    const HV1: Endpoint =
        Endpoint::new([2, 0, 0, 0, 0, 1], Ipv4Addr::new(192, 168, 2, 6));
    const HV2: Endpoint =
        Endpoint::new([2, 0, 0, 0, 0, 2], Ipv4Addr::new(192, 168, 2, 7));

    #[test]
    fn vxlan_layout() {
        let inner = gen_icmpv4_echo_req(&A, &B, 7, 1, b"ping");
        // eth + ip + icmp header + data
        assert_eq!(inner.len(), 14 + 20 + 8 + 4);

        let vni = Vni::new(1701u32).unwrap();
        let outer = encap(&HV1, &HV2, 49152, vni, &inner);
        assert_eq!(outer.len(), 14 + 20 + 8 + VXLAN_HDR_LEN + inner.len());

        let udp = &outer[34..42];
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), VXLAN_PORT);
        let vxlan = &outer[42..50];
        assert_eq!(vxlan[0], VXLAN_FLAG_VNI);
        assert_eq!(&vxlan[4..7], &vni.bytes());
        assert_eq!(&outer[50..], &inner[..]);
    }

    #[test]
    fn arp_request() {
        let arp = gen_arp_req(&A, B.ip);
        assert_eq!(&arp[..6], &[0xff; 6]);
        assert_eq!(&arp[12..14], &[0x08, 0x06]);
        // target protocol address is the last field
        assert_eq!(&arp[38..42], &B.ip.octets());
    }
}
