use pcap_parser::data::PacketData;

use crate::duration::Duration;

/// One input capture record, borrowed from the reader buffer.
pub struct Packet<'a> {
    pub ts: Duration,
    pub data: PacketData<'a>,
    pub caplen: u32,
    pub origlen: u32,
    pub pcap_index: usize,
}

/// A finished packet bound for the output file: rebuilt, synthetic or
/// pass-through. Owns its bytes so it can cross task boundaries; the writer
/// sets caplen = origlen = `data.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPacket {
    pub ts: Duration,
    pub data: Vec<u8>,
}
