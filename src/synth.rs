use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{self, MutableIpv4Packet};
use pnet_packet::ipv6::MutableIpv6Packet;
use pnet_packet::udp::{self, MutableUdpPacket};

use crate::error::Error;
use crate::five_tuple::FiveTuple;

/// TTL / hop limit of synthesized packets. Synthetic packets are meant to be
/// analyzed, not routed; the original trace rewriter used 0 and downstream
/// tools must not rely on this field.
pub const SYNTHETIC_HOP_LIMIT: u8 = 0;

const UDP_HEADER_SIZE: usize = 8;
const IPV4_HEADER_SIZE: usize = 20;
const IPV6_HEADER_SIZE: usize = 40;

/// Build a self-contained UDP datagram carrying `message`, addressed from
/// the flow's endpoints, in the flow's address family. All length and
/// checksum fields are computed here.
pub fn synthesize(flow: &FiveTuple, message: &[u8]) -> Result<Vec<u8>, Error> {
    match (flow.src, flow.dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => synthesize_v4(flow, src, dst, message),
        (IpAddr::V6(src), IpAddr::V6(dst)) => synthesize_v6(flow, src, dst, message),
        _ => Err(Error::Serialize("mixed address families in flow")),
    }
}

fn synthesize_v4(
    flow: &FiveTuple,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    message: &[u8],
) -> Result<Vec<u8>, Error> {
    let udp_len = UDP_HEADER_SIZE + message.len();
    let total_len = IPV4_HEADER_SIZE + udp_len;
    if total_len > usize::from(u16::MAX) {
        return Err(Error::Serialize("message too large for UDP/IPv4"));
    }
    let mut buf = vec![0u8; total_len];

    let mut udp = MutableUdpPacket::new(&mut buf[IPV4_HEADER_SIZE..])
        .ok_or(Error::Serialize("UDP buffer too small"))?;
    udp.set_source(flow.src_port);
    udp.set_destination(flow.dst_port);
    udp.set_length(udp_len as u16);
    udp.set_payload(message);
    let csum = udp::ipv4_checksum(&udp.to_immutable(), &src, &dst);
    // a computed zero means "checksum present", transmitted as all-ones
    udp.set_checksum(if csum == 0 { 0xffff } else { csum });

    let mut ipv4 = MutableIpv4Packet::new(&mut buf)
        .ok_or(Error::Serialize("IPv4 buffer too small"))?;
    ipv4.set_version(4);
    ipv4.set_header_length(5);
    ipv4.set_total_length(total_len as u16);
    ipv4.set_ttl(SYNTHETIC_HOP_LIMIT);
    ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ipv4.set_source(src);
    ipv4.set_destination(dst);
    let csum = ipv4::checksum(&ipv4.to_immutable());
    ipv4.set_checksum(csum);
    Ok(buf)
}

fn synthesize_v6(
    flow: &FiveTuple,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    message: &[u8],
) -> Result<Vec<u8>, Error> {
    let udp_len = UDP_HEADER_SIZE + message.len();
    if udp_len > usize::from(u16::MAX) {
        return Err(Error::Serialize("message too large for UDP/IPv6"));
    }
    let mut buf = vec![0u8; IPV6_HEADER_SIZE + udp_len];

    let mut udp = MutableUdpPacket::new(&mut buf[IPV6_HEADER_SIZE..])
        .ok_or(Error::Serialize("UDP buffer too small"))?;
    udp.set_source(flow.src_port);
    udp.set_destination(flow.dst_port);
    udp.set_length(udp_len as u16);
    udp.set_payload(message);
    let csum = udp::ipv6_checksum(&udp.to_immutable(), &src, &dst);
    udp.set_checksum(if csum == 0 { 0xffff } else { csum });

    let mut ipv6 = MutableIpv6Packet::new(&mut buf)
        .ok_or(Error::Serialize("IPv6 buffer too small"))?;
    ipv6.set_version(6);
    ipv6.set_payload_length(udp_len as u16);
    ipv6.set_next_header(IpNextHeaderProtocols::Udp);
    ipv6.set_hop_limit(SYNTHETIC_HOP_LIMIT);
    ipv6.set_source(src);
    ipv6.set_destination(dst);
    Ok(buf)
}
