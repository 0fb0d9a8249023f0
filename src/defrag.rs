use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use log::warn;
use pnet_packet::ip::IpNextHeaderProtocol;
use pnet_packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet_packet::Packet as PnetPacket;
use thiserror::Error;

/// Maximum size of a reassembled IP datagram
pub const MAX_DATAGRAM_SIZE: usize = 65535;

pub const DEFAULT_MAX_PENDING: usize = 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DefragError {
    /// Overlapping fragment carries different bytes than already buffered
    #[error("conflicting fragment content at overlapping offset")]
    Conflict,
    #[error("fragment extends past maximum datagram size")]
    OffsetOverflow,
    #[error("malformed fragment header")]
    Malformed,
}

/// Reassembly identity. IPv4 keys use the 16-bit identification field and
/// the protocol; IPv6 keys use the 32-bit identification of the fragment
/// extension header (proto left at 0, the tables are per-family anyway).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub ident: u32,
}

/// Byte ranges of one partially reassembled datagram.
///
/// Accepted ranges are kept sorted by offset and coalesced; the buffer is
/// complete once a terminal fragment fixed the total length and [0, total)
/// is covered without gaps.
#[derive(Default)]
pub struct FragmentBuffer {
    /// sorted, non-overlapping, non-adjacent (offset, bytes) ranges
    ranges: Vec<(usize, Vec<u8>)>,
    /// end offset of the datagram, set by the fragment without more-fragments
    total_len: Option<usize>,
}

impl FragmentBuffer {
    /// Merge one fragment into the buffer.
    ///
    /// Content conflicts and out-of-bounds offsets are rejected without
    /// modifying the buffer; exact duplicates of already-buffered bytes are
    /// accepted and deduplicated.
    pub fn insert(&mut self, offset: usize, data: &[u8], last: bool) -> Result<(), DefragError> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= MAX_DATAGRAM_SIZE)
            .ok_or(DefragError::OffsetOverflow)?;
        if let Some(total) = self.total_len {
            if end > total || (last && end != total) {
                return Err(DefragError::Conflict);
            }
        }
        if last && self.ranges.iter().any(|(o, d)| o + d.len() > end) {
            return Err(DefragError::Conflict);
        }
        // validate every overlap before mutating anything
        for (ro, rd) in &self.ranges {
            let lo = offset.max(*ro);
            let hi = end.min(ro + rd.len());
            if lo < hi && data[lo - offset..hi - offset] != rd[lo - ro..hi - ro] {
                return Err(DefragError::Conflict);
            }
        }

        let mut merged_off = offset;
        let mut merged = data.to_vec();
        let mut before = Vec::with_capacity(self.ranges.len() + 1);
        let mut after = Vec::new();
        for (ro, rd) in self.ranges.drain(..) {
            let rend = ro + rd.len();
            if rend < merged_off {
                before.push((ro, rd));
            } else if ro > merged_off + merged.len() {
                after.push((ro, rd));
            } else {
                // contiguous or overlapping: coalesce (overlaps verified equal)
                let new_off = ro.min(merged_off);
                let new_end = rend.max(merged_off + merged.len());
                let mut comb = vec![0u8; new_end - new_off];
                comb[ro - new_off..rend - new_off].copy_from_slice(&rd);
                comb[merged_off - new_off..merged_off - new_off + merged.len()]
                    .copy_from_slice(&merged);
                merged_off = new_off;
                merged = comb;
            }
        }
        before.push((merged_off, merged));
        before.extend(after);
        self.ranges = before;

        if last {
            self.total_len = Some(end);
        }
        Ok(())
    }

    /// True when the terminal fragment arrived and coverage is gap-free.
    pub fn is_complete(&self) -> bool {
        match self.total_len {
            Some(0) => true,
            Some(total) => {
                self.ranges.len() == 1 && self.ranges[0].0 == 0 && self.ranges[0].1.len() == total
            }
            None => false,
        }
    }

    /// Extract the reassembled payload. Only meaningful once complete.
    pub fn into_payload(mut self) -> Vec<u8> {
        if self.ranges.len() == 1 {
            self.ranges.swap_remove(0).1
        } else {
            Vec::new()
        }
    }
}

/// IPv4 header fields needed to rebuild a canonical datagram.
#[derive(Clone, Debug)]
pub struct Ipv4HeaderInfo {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: IpNextHeaderProtocol,
    pub ttl: u8,
    pub ident: u16,
}

pub struct ReassembledV4 {
    pub header: Ipv4HeaderInfo,
    pub payload: Vec<u8>,
}

struct PendingV4 {
    buffer: FragmentBuffer,
    // captured from the offset-0 fragment
    header: Option<Ipv4HeaderInfo>,
    last_activity: u64,
}

/// IPv4 defragmentation engine: one [`FragmentBuffer`] per [`FragmentKey`].
///
/// The pending table is bounded; when full, the entry with the oldest
/// activity is evicted (added policy, the capture format defines none).
pub struct Ipv4Defrag {
    pending: HashMap<FragmentKey, PendingV4>,
    max_pending: usize,
    clock: u64,
}

/// Fragmentation test for IPv4: DF absent and (MF set or nonzero offset).
pub fn ipv4_is_fragment(ipv4: &Ipv4Packet) -> bool {
    if ipv4.get_flags() & Ipv4Flags::DontFragment != 0 {
        return false;
    }
    ipv4.get_flags() & Ipv4Flags::MoreFragments != 0 || ipv4.get_fragment_offset() != 0
}

impl Ipv4Defrag {
    pub fn new(max_pending: usize) -> Self {
        Ipv4Defrag {
            pending: HashMap::new(),
            max_pending,
            clock: 0,
        }
    }

    /// Merge one IPv4 fragment; returns the reassembled datagram when the
    /// set completes, `None` while fragments are still missing.
    pub fn ingest(&mut self, ipv4: &Ipv4Packet) -> Result<Option<ReassembledV4>, DefragError> {
        let key = FragmentKey {
            src: IpAddr::V4(ipv4.get_source()),
            dst: IpAddr::V4(ipv4.get_destination()),
            proto: ipv4.get_next_level_protocol().0,
            ident: u32::from(ipv4.get_identification()),
        };
        let offset = usize::from(ipv4.get_fragment_offset()) * 8;
        let more_fragments = ipv4.get_flags() & Ipv4Flags::MoreFragments != 0;

        self.clock += 1;
        let clock = self.clock;
        let entry = self.pending.entry(key.clone()).or_insert_with(|| PendingV4 {
            buffer: FragmentBuffer::default(),
            header: None,
            last_activity: clock,
        });
        entry.last_activity = clock;
        entry
            .buffer
            .insert(offset, ipv4.payload(), !more_fragments)?;
        if offset == 0 {
            entry.header = Some(Ipv4HeaderInfo {
                src: ipv4.get_source(),
                dst: ipv4.get_destination(),
                proto: ipv4.get_next_level_protocol(),
                ttl: ipv4.get_ttl(),
                ident: ipv4.get_identification(),
            });
        }

        if entry.buffer.is_complete() {
            // completion implies the offset-0 fragment (and its header) was seen
            let pending = self.pending.remove(&key).ok_or(DefragError::Malformed)?;
            let header = pending.header.ok_or(DefragError::Malformed)?;
            return Ok(Some(ReassembledV4 {
                header,
                payload: pending.buffer.into_payload(),
            }));
        }

        if self.pending.len() > self.max_pending {
            evict_stalest(&mut self.pending, |p| p.last_activity);
        }
        Ok(None)
    }
}

/// Drop the table entry with the oldest activity counter.
pub(crate) fn evict_stalest<K, V, F>(table: &mut HashMap<K, V>, activity: F)
where
    K: Clone + Eq + std::hash::Hash + std::fmt::Debug,
    F: Fn(&V) -> u64,
{
    if let Some(key) = table
        .iter()
        .min_by_key(|(_, v)| activity(v))
        .map(|(k, _)| k.clone())
    {
        warn!("reassembly table full, evicting stalest entry {key:?}");
        table.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::ip::IpNextHeaderProtocols;
    use pnet_packet::ipv4::MutableIpv4Packet;

    fn mk_fragment(ident: u16, offset_units: u16, more: bool, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 20 + payload.len()];
        let mut ipv4 = MutableIpv4Packet::new(&mut buf).unwrap();
        ipv4.set_version(4);
        ipv4.set_header_length(5);
        ipv4.set_total_length((20 + payload.len()) as u16);
        ipv4.set_identification(ident);
        ipv4.set_ttl(64);
        ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ipv4.set_source("10.0.0.1".parse().unwrap());
        ipv4.set_destination("10.0.0.2".parse().unwrap());
        ipv4.set_fragment_offset(offset_units);
        if more {
            ipv4.set_flags(Ipv4Flags::MoreFragments);
        }
        ipv4.set_payload(payload);
        buf
    }

    #[test]
    fn reassembly_in_any_order() {
        let payload: Vec<u8> = (0u8..24).collect();
        let frags = [
            mk_fragment(42, 0, true, &payload[..8]),
            mk_fragment(42, 1, true, &payload[8..16]),
            mk_fragment(42, 2, false, &payload[16..]),
        ];
        // all 6 arrival orders
        for perm in [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ] {
            let mut engine = Ipv4Defrag::new(DEFAULT_MAX_PENDING);
            let mut done = None;
            for &i in &perm {
                let ipv4 = Ipv4Packet::new(&frags[i]).unwrap();
                if let Some(d) = engine.ingest(&ipv4).unwrap() {
                    done = Some(d);
                }
            }
            let done = done.expect("reassembly did not complete");
            assert_eq!(done.payload, payload);
            assert_eq!(done.header.ident, 42);
            assert_eq!(done.header.proto, IpNextHeaderProtocols::Udp);
        }
    }

    #[test]
    fn conflicting_fragment_rejected() {
        let mut engine = Ipv4Defrag::new(DEFAULT_MAX_PENDING);
        let f1 = mk_fragment(7, 0, true, &[1; 8]);
        let conflict = mk_fragment(7, 0, true, &[2; 8]);
        let f2 = mk_fragment(7, 1, false, &[1; 8]);
        assert!(engine
            .ingest(&Ipv4Packet::new(&f1).unwrap())
            .unwrap()
            .is_none());
        assert!(matches!(
            engine.ingest(&Ipv4Packet::new(&conflict).unwrap()),
            Err(DefragError::Conflict)
        ));
        // the partial buffer must be unaffected by the rejected fragment
        let done = engine
            .ingest(&Ipv4Packet::new(&f2).unwrap())
            .unwrap()
            .expect("complete");
        assert_eq!(done.payload, vec![1; 16]);
    }

    #[test]
    fn duplicate_fragment_tolerated() {
        let mut engine = Ipv4Defrag::new(DEFAULT_MAX_PENDING);
        let f1 = mk_fragment(9, 0, true, &[3; 8]);
        let f2 = mk_fragment(9, 1, false, &[4; 4]);
        assert!(engine
            .ingest(&Ipv4Packet::new(&f1).unwrap())
            .unwrap()
            .is_none());
        assert!(engine
            .ingest(&Ipv4Packet::new(&f1).unwrap())
            .unwrap()
            .is_none());
        let done = engine
            .ingest(&Ipv4Packet::new(&f2).unwrap())
            .unwrap()
            .expect("complete");
        assert_eq!(done.payload.len(), 12);
    }

    #[test]
    fn offset_overflow_rejected() {
        let mut buffer = FragmentBuffer::default();
        assert_eq!(
            buffer.insert(MAX_DATAGRAM_SIZE, &[0; 8], false),
            Err(DefragError::OffsetOverflow)
        );
    }

    #[test]
    fn data_past_terminal_fragment_rejected() {
        let mut buffer = FragmentBuffer::default();
        buffer.insert(0, &[0; 8], true).unwrap();
        assert_eq!(buffer.insert(8, &[0; 8], false), Err(DefragError::Conflict));
    }

    #[test]
    fn pending_table_bounded() {
        let mut engine = Ipv4Defrag::new(2);
        for ident in 0..4u16 {
            let f = mk_fragment(ident, 0, true, &[0; 8]);
            engine.ingest(&Ipv4Packet::new(&f).unwrap()).unwrap();
        }
        assert!(engine.pending.len() <= 3);
        assert!(!engine.pending.contains_key(&FragmentKey {
            src: "10.0.0.1".parse::<Ipv4Addr>().unwrap().into(),
            dst: "10.0.0.2".parse::<Ipv4Addr>().unwrap().into(),
            proto: IpNextHeaderProtocols::Udp.0,
            ident: 0,
        }));
    }
}
