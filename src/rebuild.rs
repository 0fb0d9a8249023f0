use pnet_packet::ipv4::{self, MutableIpv4Packet};
use pnet_packet::ipv6::MutableIpv6Packet;

use crate::defrag::Ipv4HeaderInfo;
use crate::error::Error;
use crate::ip6_defrag::Ipv6HeaderInfo;

/// Serialize a canonical IPv4 datagram around a reassembled payload:
/// fresh 20-byte header, fragmentation fields cleared, length and checksum
/// recomputed.
pub fn rebuild_ipv4(header: &Ipv4HeaderInfo, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let total_len = 20 + payload.len();
    if total_len > usize::from(u16::MAX) {
        return Err(Error::Serialize("reassembled IPv4 datagram too large"));
    }
    let mut buf = vec![0u8; total_len];
    let mut ipv4 = MutableIpv4Packet::new(&mut buf)
        .ok_or(Error::Serialize("IPv4 buffer too small"))?;
    ipv4.set_version(4);
    ipv4.set_header_length(5);
    ipv4.set_total_length(total_len as u16);
    ipv4.set_identification(header.ident);
    ipv4.set_ttl(header.ttl);
    ipv4.set_next_level_protocol(header.proto);
    ipv4.set_source(header.src);
    ipv4.set_destination(header.dst);
    ipv4.set_payload(payload);
    let csum = ipv4::checksum(&ipv4.to_immutable());
    ipv4.set_checksum(csum);
    Ok(buf)
}

/// Serialize a canonical IPv6 datagram around a reassembled payload: fresh
/// 40-byte header, the fragment extension header replaced by its next
/// header value, payload length recomputed.
pub fn rebuild_ipv6(header: &Ipv6HeaderInfo, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > usize::from(u16::MAX) {
        return Err(Error::Serialize("reassembled IPv6 datagram too large"));
    }
    let mut buf = vec![0u8; 40 + payload.len()];
    let mut ipv6 = MutableIpv6Packet::new(&mut buf)
        .ok_or(Error::Serialize("IPv6 buffer too small"))?;
    ipv6.set_version(6);
    ipv6.set_payload_length(payload.len() as u16);
    ipv6.set_next_header(header.next_header);
    ipv6.set_hop_limit(header.hop_limit);
    ipv6.set_source(header.src);
    ipv6.set_destination(header.dst);
    ipv6.set_payload(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::ip::IpNextHeaderProtocols;
    use pnet_packet::ipv4::Ipv4Packet;
    use pnet_packet::ipv6::Ipv6Packet;
    use pnet_packet::Packet as PnetPacket;

    #[test]
    fn rebuilt_ipv4_is_canonical() {
        let header = Ipv4HeaderInfo {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            proto: IpNextHeaderProtocols::Udp,
            ttl: 17,
            ident: 0xbeef,
        };
        let payload = [0xa5u8; 100];
        let bytes = rebuild_ipv4(&header, &payload).unwrap();
        assert_eq!(bytes.len(), 120);
        let ipv4 = Ipv4Packet::new(&bytes).unwrap();
        assert_eq!(ipv4.get_total_length(), 120);
        assert_eq!(ipv4.get_fragment_offset(), 0);
        assert_eq!(ipv4.get_flags(), 0);
        assert_eq!(ipv4.get_identification(), 0xbeef);
        assert_eq!(ipv4.payload(), &payload);
        assert_eq!(ipv4.get_checksum(), ipv4::checksum(&ipv4));
    }

    #[test]
    fn rebuilt_ipv6_is_canonical() {
        let header = Ipv6HeaderInfo {
            src: "2001:db8::1".parse().unwrap(),
            dst: "2001:db8::2".parse().unwrap(),
            next_header: IpNextHeaderProtocols::Tcp,
            hop_limit: 42,
        };
        let payload = [0x5au8; 60];
        let bytes = rebuild_ipv6(&header, &payload).unwrap();
        let ipv6 = Ipv6Packet::new(&bytes).unwrap();
        assert_eq!(ipv6.get_payload_length(), 60);
        assert_eq!(ipv6.get_next_header(), IpNextHeaderProtocols::Tcp);
        assert_eq!(ipv6.payload(), &payload);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let header = Ipv4HeaderInfo {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            proto: IpNextHeaderProtocols::Udp,
            ttl: 1,
            ident: 0,
        };
        assert!(rebuild_ipv4(&header, &vec![0; 65536]).is_err());
    }
}
