use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};

use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::Packet as PnetPacket;

use crate::defrag::{evict_stalest, DefragError, FragmentBuffer, FragmentKey};

/// View over an IPv6 fragment extension header (RFC 8200 §4.5).
#[derive(PartialEq)]
pub struct Ipv6FragmentHeader<'a> {
    data: &'a [u8],
}

impl<'a> Ipv6FragmentHeader<'a> {
    /// Returns `None` if the slice is shorter than the fixed 8-byte header.
    pub fn new(data: &'a [u8]) -> Option<Ipv6FragmentHeader<'a>> {
        if data.len() >= 8 {
            Some(Ipv6FragmentHeader { data })
        } else {
            None
        }
    }

    pub fn get_next_header(&self) -> IpNextHeaderProtocol {
        IpNextHeaderProtocol::new(self.data[0])
    }

    /// Fragment offset in 8-byte units.
    pub fn get_fragment_offset(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]]) >> 3
    }

    pub fn more_fragments(&self) -> bool {
        self.data[3] & 0x1 != 0
    }

    pub fn get_identification(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    /// The fragmentable part carried by this fragment.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[8..]
    }
}

/// Walk the extension header chain and return the fragment header, if any.
///
/// Hop-by-hop, routing and destination-options headers are skipped; the walk
/// stops at the first transport (or unknown) header.
pub fn find_fragment_header<'a>(ipv6: &'a Ipv6Packet) -> Option<Ipv6FragmentHeader<'a>> {
    let mut next = ipv6.get_next_header();
    let mut data = ipv6.payload();
    // chain length guard against malformed loops
    for _ in 0..8 {
        match next {
            IpNextHeaderProtocols::Ipv6Frag => return Ipv6FragmentHeader::new(data),
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
                next = IpNextHeaderProtocol::new(data[0]);
                data = &data[ext_len..];
            }
            _ => return None,
        }
    }
    None
}

/// IPv6 header fields needed to rebuild a canonical datagram.
#[derive(Clone, Debug)]
pub struct Ipv6HeaderInfo {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    /// next header of the reassembled payload, from the fragment header
    pub next_header: IpNextHeaderProtocol,
    pub hop_limit: u8,
}

pub struct ReassembledV6 {
    pub header: Ipv6HeaderInfo,
    pub payload: Vec<u8>,
}

struct PendingV6 {
    buffer: FragmentBuffer,
    header: Ipv6HeaderInfo,
    last_activity: u64,
}

/// IPv6 defragmentation engine. Same reassembly algorithm as IPv4 (offset
/// and gap tracking in [`FragmentBuffer`]) but keyed and parsed from the
/// fragment extension header.
pub struct Ipv6Defrag {
    pending: HashMap<FragmentKey, PendingV6>,
    max_pending: usize,
    clock: u64,
}

impl Ipv6Defrag {
    pub fn new(max_pending: usize) -> Self {
        Ipv6Defrag {
            pending: HashMap::new(),
            max_pending,
            clock: 0,
        }
    }

    /// Merge one IPv6 fragment; returns the reassembled datagram when the
    /// set completes, `None` while fragments are still missing.
    pub fn ingest(&mut self, ipv6: &Ipv6Packet) -> Result<Option<ReassembledV6>, DefragError> {
        let frag = find_fragment_header(ipv6).ok_or(DefragError::Malformed)?;
        let key = FragmentKey {
            src: IpAddr::V6(ipv6.get_source()),
            dst: IpAddr::V6(ipv6.get_destination()),
            proto: 0,
            ident: frag.get_identification(),
        };
        let offset = usize::from(frag.get_fragment_offset()) * 8;
        let more_fragments = frag.more_fragments();

        self.clock += 1;
        let clock = self.clock;
        let entry = self.pending.entry(key.clone()).or_insert_with(|| PendingV6 {
            buffer: FragmentBuffer::default(),
            header: Ipv6HeaderInfo {
                src: ipv6.get_source(),
                dst: ipv6.get_destination(),
                next_header: frag.get_next_header(),
                hop_limit: ipv6.get_hop_limit(),
            },
            last_activity: clock,
        });
        entry.last_activity = clock;
        entry.buffer.insert(offset, frag.payload(), !more_fragments)?;
        if offset == 0 {
            // only the first fragment's next-header value is authoritative
            entry.header.next_header = frag.get_next_header();
        }

        if entry.buffer.is_complete() {
            let pending = self.pending.remove(&key).ok_or(DefragError::Malformed)?;
            return Ok(Some(ReassembledV6 {
                header: pending.header,
                payload: pending.buffer.into_payload(),
            }));
        }

        if self.pending.len() > self.max_pending {
            evict_stalest(&mut self.pending, |p| p.last_activity);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defrag::DEFAULT_MAX_PENDING;
    use pnet_packet::ipv6::MutableIpv6Packet;

    const FRAG_HDR: &[u8] = b"\x11\x00\x00\x01\xf8\x8e\xb4\x66";

    #[test]
    fn fragment_header_fields() {
        let frag = Ipv6FragmentHeader::new(FRAG_HDR).expect("Ipv6FragmentHeader");
        assert_eq!(frag.get_next_header(), IpNextHeaderProtocols::Udp);
        assert_eq!(frag.get_fragment_offset(), 0);
        assert!(frag.more_fragments());
        assert_eq!(frag.get_identification(), 0xf88e_b466);
    }

    fn mk_fragment(
        ident: u32,
        offset_units: u16,
        more: bool,
        next_header: IpNextHeaderProtocol,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut frag_part = vec![0u8; 8 + payload.len()];
        frag_part[0] = next_header.0;
        frag_part[2..4].copy_from_slice(&((offset_units << 3) | u16::from(more)).to_be_bytes());
        frag_part[4..8].copy_from_slice(&ident.to_be_bytes());
        frag_part[8..].copy_from_slice(payload);

        let mut buf = vec![0u8; 40 + frag_part.len()];
        let mut ipv6 = MutableIpv6Packet::new(&mut buf).unwrap();
        ipv6.set_version(6);
        ipv6.set_payload_length(frag_part.len() as u16);
        ipv6.set_next_header(IpNextHeaderProtocols::Ipv6Frag);
        ipv6.set_hop_limit(64);
        ipv6.set_source("2001:db8::1".parse().unwrap());
        ipv6.set_destination("2001:db8::2".parse().unwrap());
        ipv6.set_payload(&frag_part);
        buf
    }

    #[test]
    fn reassembly_out_of_order() {
        let payload: Vec<u8> = (0u8..20).collect();
        let f1 = mk_fragment(0xabcd, 0, true, IpNextHeaderProtocols::Udp, &payload[..16]);
        let f2 = mk_fragment(0xabcd, 2, false, IpNextHeaderProtocols::Udp, &payload[16..]);

        let mut engine = Ipv6Defrag::new(DEFAULT_MAX_PENDING);
        assert!(engine
            .ingest(&Ipv6Packet::new(&f2).unwrap())
            .unwrap()
            .is_none());
        let done = engine
            .ingest(&Ipv6Packet::new(&f1).unwrap())
            .unwrap()
            .expect("complete");
        assert_eq!(done.payload, payload);
        assert_eq!(done.header.next_header, IpNextHeaderProtocols::Udp);
        assert_eq!(done.header.src, "2001:db8::1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn next_header_taken_from_first_fragment() {
        // non-first fragments may carry a stale next-header value; only the
        // offset-0 fragment's is authoritative (RFC 8200 §4.5)
        let payload: Vec<u8> = (0u8..16).collect();
        let tail = mk_fragment(0x42, 1, false, IpNextHeaderProtocols::Ipv6NoNxt, &payload[8..]);
        let head = mk_fragment(0x42, 0, true, IpNextHeaderProtocols::Udp, &payload[..8]);

        let mut engine = Ipv6Defrag::new(DEFAULT_MAX_PENDING);
        assert!(engine
            .ingest(&Ipv6Packet::new(&tail).unwrap())
            .unwrap()
            .is_none());
        let done = engine
            .ingest(&Ipv6Packet::new(&head).unwrap())
            .unwrap()
            .expect("complete");
        assert_eq!(done.header.next_header, IpNextHeaderProtocols::Udp);
        assert_eq!(done.payload, payload);
    }

    #[test]
    fn non_fragment_is_malformed() {
        let mut buf = vec![0u8; 48];
        let mut ipv6 = MutableIpv6Packet::new(&mut buf).unwrap();
        ipv6.set_version(6);
        ipv6.set_payload_length(8);
        ipv6.set_next_header(IpNextHeaderProtocols::Udp);
        let mut engine = Ipv6Defrag::new(DEFAULT_MAX_PENDING);
        assert!(matches!(
            engine.ingest(&Ipv6Packet::new(&buf).unwrap()),
            Err(DefragError::Malformed)
        ));
    }
}
