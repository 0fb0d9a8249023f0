use pcap_parser::data::PacketData;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;

use crate::defrag::ipv4_is_fragment;
use crate::five_tuple::FiveTuple;
use crate::ip6_defrag::find_fragment_header;

/// Decoded TCP segment, ready for the stream reassembler.
pub struct TcpMeta<'a> {
    pub flow: FiveTuple,
    pub seq: u32,
    pub flags: u8,
    pub payload: &'a [u8],
}

/// Disposition of one captured packet, decoded once by the classifier and
/// consumed by pattern matching.
pub enum Disposition<'a> {
    /// Complete (non-fragmented) datagram carrying TCP
    Tcp(TcpMeta<'a>),
    /// IPv4 fragment, bound for IPv4 reassembly
    FragmentV4(Ipv4Packet<'a>),
    /// IPv6 packet with a fragment extension header
    FragmentV6(Ipv6Packet<'a>),
    /// Nothing to do, forward unchanged
    PassThrough,
}

/// Extract the network-layer bytes of a record.
///
/// Returns `None` when there is no recognized IP layer (non-IP ethertype,
/// unsupported link type); such packets pass through at their raw bytes.
pub fn l3_data<'a>(data: &PacketData<'a>) -> Option<&'a [u8]> {
    match *data {
        PacketData::L3(_, d) => Some(d),
        PacketData::L2(d) => {
            let eth = EthernetPacket::new(d)?;
            match eth.get_ethertype() {
                EtherTypes::Ipv4 | EtherTypes::Ipv6 => Some(&d[14..]),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Classify one network-layer packet.
///
/// Rules, in order: a fragmented packet never exposes a transport layer, so
/// it routes to reassembly even when its leading payload bytes would parse
/// as TCP; a non-fragmented packet whose transport is TCP routes to the TCP
/// path; everything else (including anything unparseable) passes through.
pub fn classify(l3: &[u8]) -> Disposition {
    match l3.first().map(|b| b >> 4) {
        Some(4) => classify_v4(l3),
        Some(6) => classify_v6(l3),
        _ => Disposition::PassThrough,
    }
}

fn classify_v4(l3: &[u8]) -> Disposition {
    let ipv4 = match Ipv4Packet::new(l3) {
        Some(ipv4) => ipv4,
        None => return Disposition::PassThrough,
    };
    let ihl = usize::from(ipv4.get_header_length()) * 4;
    let total_len = usize::from(ipv4.get_total_length());
    if ihl < 20 || total_len < ihl || total_len > l3.len() {
        return Disposition::PassThrough;
    }
    // remove link-layer padding
    let l3 = &l3[..total_len];
    let ipv4 = match Ipv4Packet::new(l3) {
        Some(ipv4) => ipv4,
        None => return Disposition::PassThrough,
    };
    if ipv4_is_fragment(&ipv4) {
        return Disposition::FragmentV4(ipv4);
    }
    if ipv4.get_next_level_protocol() == IpNextHeaderProtocols::Tcp {
        let src = ipv4.get_source();
        let dst = ipv4.get_destination();
        if let Some(meta) = tcp_meta(src.into(), dst.into(), &l3[ihl..]) {
            return Disposition::Tcp(meta);
        }
    }
    Disposition::PassThrough
}

fn classify_v6(l3: &[u8]) -> Disposition {
    let ipv6 = match Ipv6Packet::new(l3) {
        Some(ipv6) => ipv6,
        None => return Disposition::PassThrough,
    };
    if find_fragment_header(&ipv6).is_some() {
        return Disposition::FragmentV6(ipv6);
    }
    let payload_end = (40 + usize::from(ipv6.get_payload_length())).min(l3.len());
    if let Some((proto, l4)) = v6_transport(ipv6.get_next_header(), &l3[40.min(l3.len())..payload_end])
    {
        if proto == IpNextHeaderProtocols::Tcp {
            let src = ipv6.get_source();
            let dst = ipv6.get_destination();
            if let Some(meta) = tcp_meta(src.into(), dst.into(), l4) {
                return Disposition::Tcp(meta);
            }
        }
    }
    Disposition::PassThrough
}

/// Skip IPv6 extension headers down to the transport header.
fn v6_transport(
    first: IpNextHeaderProtocol,
    mut data: &[u8],
) -> Option<(IpNextHeaderProtocol, &[u8])> {
    let mut proto = first;
    for _ in 0..8 {
        match proto {
            IpNextHeaderProtocols::Hopopt
            | IpNextHeaderProtocols::Ipv6Route
            | IpNextHeaderProtocols::Ipv6Opts => {
                if data.len() < 2 {
                    return None;
                }
                let ext_len = (usize::from(data[1]) + 1) * 8;
                if data.len() < ext_len {
                    return None;
                }
                proto = IpNextHeaderProtocol::new(data[0]);
                data = &data[ext_len..];
            }
            _ => return Some((proto, data)),
        }
    }
    None
}

fn tcp_meta<'a>(
    src: std::net::IpAddr,
    dst: std::net::IpAddr,
    l4: &'a [u8],
) -> Option<TcpMeta<'a>> {
    let tcp = TcpPacket::new(l4)?;
    let data_offset = usize::from(tcp.get_data_offset()) * 4;
    if data_offset < 20 || data_offset > l4.len() {
        return None;
    }
    Some(TcpMeta {
        flow: FiveTuple {
            proto: IpNextHeaderProtocols::Tcp.0,
            src,
            dst,
            src_port: tcp.get_source(),
            dst_port: tcp.get_destination(),
        },
        seq: tcp.get_sequence(),
        flags: tcp.get_flags(),
        payload: &l4[data_offset..],
    })
}
