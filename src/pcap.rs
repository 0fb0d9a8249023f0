use std::io::{Read, Write};

use log::{debug, warn};
use pcap_parser::data::get_packetdata;
use pcap_parser::*;

use crate::duration::Duration;
use crate::error::Error;
use crate::packet::{OutputPacket, Packet};

const MICROS_PER_SEC: u32 = 1_000_000;
const BUFFER_CAPACITY: usize = 65536 * 8;

/// Snapshot length declared in the output file header.
pub const OUTPUT_SNAPLEN: u32 = 65536;
/// Output records are raw IP packets, no link-layer framing.
pub const OUTPUT_LINKTYPE: Linktype = Linktype::RAW;

/// Information about a capture interface, kept per pcap-ng section.
struct InterfaceInfo {
    link_type: Linktype,
    if_tsresol: u8,
    if_tsoffset: u64,
}

fn build_interface(idb: &InterfaceDescriptionBlock) -> InterfaceInfo {
    let mut if_tsresol = 6;
    let mut if_tsoffset = 0;
    for opt in idb.options.iter() {
        match opt.code {
            OptionCode::IfTsresol => {
                if let Some(&v) = opt.value.first() {
                    if_tsresol = v;
                }
            }
            OptionCode::IfTsoffset => {
                if let Ok(bytes) = <[u8; 8]>::try_from(&opt.value[..8.min(opt.value.len())]) {
                    if_tsoffset = u64::from_le_bytes(bytes);
                }
            }
            _ => (),
        }
    }
    InterfaceInfo {
        link_type: Linktype(idb.linktype.0),
        if_tsresol,
        if_tsoffset,
    }
}

/// Read all records of a pcap or pcap-ng capture and call `f` for each
/// decodable packet. Undecodable records are logged and skipped.
pub fn for_each_packet<R, F>(input: R, mut f: F) -> Result<(), Error>
where
    R: Read + Send,
    F: FnMut(&Packet) -> Result<(), Error>,
{
    let mut reader = create_reader(BUFFER_CAPACITY, input)?;
    let mut interfaces: Vec<InterfaceInfo> = Vec::new();
    let mut pcap_index = 0usize;
    let mut last_incomplete_index = 0usize;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(ref hdr) => {
                        debug!("legacy pcap, link type {}", hdr.network);
                        interfaces = vec![InterfaceInfo {
                            link_type: hdr.network,
                            if_tsresol: 6,
                            if_tsoffset: 0,
                        }];
                    }
                    PcapBlockOwned::Legacy(ref b) => {
                        pcap_index += 1;
                        match interfaces.first() {
                            Some(if_info) => {
                                match get_packetdata(b.data, if_info.link_type, b.caplen as usize) {
                                    Some(data) => {
                                        let packet = Packet {
                                            ts: Duration::new(b.ts_sec, b.ts_usec),
                                            data,
                                            caplen: b.caplen,
                                            origlen: b.origlen,
                                            pcap_index,
                                        };
                                        f(&packet)?;
                                    }
                                    None => warn!("could not get packet data (idx={pcap_index})"),
                                }
                            }
                            None => warn!("packet record before file header (idx={pcap_index})"),
                        }
                    }
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        debug!("pcap-ng: new section");
                        interfaces.clear();
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(ref idb)) => {
                        interfaces.push(build_interface(idb));
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(ref epb)) => {
                        pcap_index += 1;
                        match interfaces.get(epb.if_id as usize) {
                            Some(if_info) => {
                                let unit = build_ts_resolution(if_info.if_tsresol)
                                    .unwrap_or(u64::from(MICROS_PER_SEC));
                                let (ts_sec, ts_frac) =
                                    build_ts(epb.ts_high, epb.ts_low, if_info.if_tsoffset, unit);
                                let micros = u64::from(MICROS_PER_SEC);
                                let ts_usec = if unit > micros {
                                    (u64::from(ts_frac) / (unit / micros)) as u32
                                } else if unit != 0 && unit < micros {
                                    // coarser than microseconds
                                    ts_frac * ((micros / unit) as u32)
                                } else {
                                    ts_frac
                                };
                                match get_packetdata(
                                    epb.data,
                                    if_info.link_type,
                                    epb.caplen as usize,
                                ) {
                                    Some(data) => {
                                        let packet = Packet {
                                            ts: Duration::new(ts_sec, ts_usec),
                                            data,
                                            caplen: epb.caplen,
                                            origlen: epb.origlen,
                                            pcap_index,
                                        };
                                        f(&packet)?;
                                    }
                                    None => warn!("could not get packet data (idx={pcap_index})"),
                                }
                            }
                            None => warn!("EPB references unknown interface (idx={pcap_index})"),
                        }
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(ref spb)) => {
                        pcap_index += 1;
                        match interfaces.first() {
                            Some(if_info) => {
                                let blen = (spb.block_len1 - 16) as usize;
                                match get_packetdata(spb.data, if_info.link_type, blen) {
                                    Some(data) => {
                                        let packet = Packet {
                                            ts: Duration::default(),
                                            data,
                                            caplen: spb.origlen,
                                            origlen: spb.origlen,
                                            pcap_index,
                                        };
                                        f(&packet)?;
                                    }
                                    None => warn!("could not get packet data (idx={pcap_index})"),
                                }
                            }
                            None => warn!("SPB before interface description (idx={pcap_index})"),
                        }
                    }
                    PcapBlockOwned::NG(_) => (),
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                if last_incomplete_index == pcap_index {
                    warn!("could not read complete data block, input may be truncated");
                    break;
                }
                last_incomplete_index = pcap_index;
                reader.refill()?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Writer for the legacy pcap format.
pub struct PcapWriter<W>
where
    W: Write,
{
    w: W,
}

impl<W: Write> PcapWriter<W> {
    pub fn new(w: W) -> Self {
        PcapWriter { w }
    }

    pub fn init_file(&mut self, snaplen: u32, linktype: Linktype) -> Result<usize, Error> {
        let mut hdr = PcapHeader::new();
        hdr.snaplen = snaplen;
        hdr.network = linktype;
        let s = hdr
            .to_vec()
            .or(Err(Error::Serialize("pcap header serialization failed")))?;
        self.w.write(&s).map_err(Error::Io)
    }

    /// Append one record; caplen and origlen are the serialized byte count.
    pub fn write_packet(&mut self, packet: &OutputPacket) -> Result<usize, Error> {
        let record = LegacyPcapBlock {
            ts_sec: packet.ts.secs,
            ts_usec: packet.ts.micros,
            caplen: packet.data.len() as u32,
            origlen: packet.data.len() as u32,
            data: &packet.data,
        };
        let s = record
            .to_vec_raw()
            .or(Err(Error::Serialize("pcap record serialization failed")))?;
        self.w.write(&s).map_err(Error::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_parser::data::PacketData;

    #[test]
    fn written_records_read_back() {
        let packets = [
            OutputPacket {
                ts: Duration::new(10, 20),
                data: vec![0x45, 0x00, 0x00, 0x14],
            },
            OutputPacket {
                ts: Duration::new(11, 0),
                data: vec![0x60, 0x01, 0x02, 0x03],
            },
        ];
        let mut out = Vec::new();
        let mut writer = PcapWriter::new(&mut out);
        writer.init_file(OUTPUT_SNAPLEN, OUTPUT_LINKTYPE).unwrap();
        for p in &packets {
            writer.write_packet(p).unwrap();
        }

        let mut seen = Vec::new();
        for_each_packet(&out[..], |packet| {
            let data = match packet.data {
                PacketData::L3(_, d) => d.to_vec(),
                _ => panic!("expected L3 data for raw link type"),
            };
            assert_eq!(packet.caplen as usize, data.len());
            seen.push(OutputPacket {
                ts: packet.ts,
                data,
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, packets);
    }
}
