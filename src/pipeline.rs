use std::io::{Read, Write};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use pcap_parser::data::PacketData;

use crate::classify::{self, Disposition, TcpMeta};
use crate::config::Config;
use crate::defrag::{Ipv4Defrag, DEFAULT_MAX_PENDING};
use crate::duration::Duration;
use crate::error::Error;
use crate::five_tuple::FiveTuple;
use crate::framer::MessageFramer;
use crate::ip6_defrag::Ipv6Defrag;
use crate::packet::OutputPacket;
use crate::pcap::{for_each_packet, PcapWriter, OUTPUT_LINKTYPE, OUTPUT_SNAPLEN};
use crate::rebuild::{rebuild_ipv4, rebuild_ipv6};
use crate::synth::synthesize;
use crate::tcp_reassembly::{
    SegmentInput, StreamEvent, StreamFactory, TcpStreamAssembler, DEFAULT_MAX_FLOWS,
};

pub const DEFAULT_QUEUE_SIZE: usize = 64;

#[derive(Debug, Default)]
pub struct Stats {
    pub packets_read: usize,
    pub passed_through: usize,
    pub datagrams_reassembled: usize,
    pub messages_synthesized: u64,
    pub records_written: usize,
    pub write_errors: usize,
}

/// Run the full normalization pipeline: read `input`, write the rewritten
/// capture to `output`.
///
/// Task graph: the calling thread reads, classifies and defragments; one
/// thread assembles TCP streams for all flows; one thread per flow frames
/// and synthesizes messages; one thread writes the output sequentially.
/// All queues are bounded, so a slow writer backpressures the reader.
/// Within a flow, message order follows stream order; across flows and
/// paths, output order is unspecified.
pub fn pcap_to_udp<R, W>(input: R, output: W, config: &Config) -> Result<Stats, Error>
where
    R: Read + Send,
    W: Write + Send,
{
    let queue_size = config
        .get_usize("pipeline.queue_size")
        .unwrap_or(DEFAULT_QUEUE_SIZE);
    let max_pending = config
        .get_usize("defrag.max_pending")
        .unwrap_or(DEFAULT_MAX_PENDING);
    let max_flows = config.get_usize("tcp.max_flows").unwrap_or(DEFAULT_MAX_FLOWS);

    let (out_tx, out_rx) = bounded::<OutputPacket>(queue_size);
    let (tcp_tx, tcp_rx) = bounded::<SegmentInput>(queue_size);

    thread::scope(|s| {
        let sink = thread::Builder::new()
            .name("sink".to_owned())
            .spawn_scoped(s, move || sink_loop(output, out_rx))
            .map_err(Error::Io)?;
        let assembly_out = out_tx.clone();
        let assembly = thread::Builder::new()
            .name("tcp-assembly".to_owned())
            .spawn_scoped(s, move || {
                assembly_loop(tcp_rx, assembly_out, queue_size, max_flows)
            })
            .map_err(Error::Io)?;

        let mut reader = ReaderTask {
            v4_defrag: Ipv4Defrag::new(max_pending),
            v6_defrag: Ipv6Defrag::new(max_pending),
            tcp_tx,
            out_tx,
            packets_read: 0,
            passed_through: 0,
            datagrams_reassembled: 0,
        };
        let read_result = for_each_packet(input, |packet| {
            reader.handle_packet(packet.ts, &packet.data);
            Ok(())
        });
        let packets_read = reader.packets_read;
        let passed_through = reader.passed_through;
        let datagrams_reassembled = reader.datagrams_reassembled;
        // close the tcp and output queues so downstream tasks terminate
        drop(reader);

        let messages_synthesized = assembly
            .join()
            .map_err(|_| Error::Generic("tcp-assembly task panicked"))?;
        let (records_written, write_errors) = sink
            .join()
            .map_err(|_| Error::Generic("sink task panicked"))??;
        read_result?;

        Ok(Stats {
            packets_read,
            passed_through,
            datagrams_reassembled,
            messages_synthesized,
            records_written,
            write_errors,
        })
    })
}

/// State owned by the reader task: both defragmenters and the sending ends
/// of the TCP and output queues.
struct ReaderTask {
    v4_defrag: Ipv4Defrag,
    v6_defrag: Ipv6Defrag,
    tcp_tx: Sender<SegmentInput>,
    out_tx: Sender<OutputPacket>,
    packets_read: usize,
    passed_through: usize,
    datagrams_reassembled: usize,
}

impl ReaderTask {
    fn handle_packet(&mut self, ts: Duration, data: &PacketData) {
        self.packets_read += 1;
        match classify::l3_data(data) {
            Some(l3) => self.handle_l3(ts, l3),
            None => {
                // no recognized IP layer: forward the raw bytes unchanged
                let raw = match *data {
                    PacketData::L2(d)
                    | PacketData::L3(_, d)
                    | PacketData::L4(_, d)
                    | PacketData::Unsupported(d) => d,
                };
                self.pass_through(ts, raw.to_vec());
            }
        }
    }

    fn handle_l3(&mut self, ts: Duration, l3: &[u8]) {
        match classify::classify(l3) {
            Disposition::Tcp(meta) => self.send_segment(ts, &meta),
            Disposition::FragmentV4(ref ipv4) => match self.v4_defrag.ingest(ipv4) {
                Ok(Some(done)) => {
                    self.datagrams_reassembled += 1;
                    match rebuild_ipv4(&done.header, &done.payload) {
                        Ok(bytes) => self.handle_rebuilt(ts, bytes),
                        Err(e) => {
                            // forward the triggering fragment so no data is lost
                            warn!("could not rebuild IPv4 datagram: {e}");
                            self.pass_through(ts, l3.to_vec());
                        }
                    }
                }
                Ok(None) => (),
                Err(e) => warn!("IPv4 defrag error, skipping fragment: {e}"),
            },
            Disposition::FragmentV6(ref ipv6) => match self.v6_defrag.ingest(ipv6) {
                Ok(Some(done)) => {
                    self.datagrams_reassembled += 1;
                    match rebuild_ipv6(&done.header, &done.payload) {
                        Ok(bytes) => self.handle_rebuilt(ts, bytes),
                        Err(e) => {
                            warn!("could not rebuild IPv6 datagram: {e}");
                            self.pass_through(ts, l3.to_vec());
                        }
                    }
                }
                Ok(None) => (),
                Err(e) => warn!("IPv6 defrag error, skipping fragment: {e}"),
            },
            Disposition::PassThrough => self.pass_through(ts, l3.to_vec()),
        }
    }

    /// A reassembled datagram is classified once more: it may be a complete
    /// TCP datagram now, which belongs on the TCP path.
    fn handle_rebuilt(&mut self, ts: Duration, bytes: Vec<u8>) {
        match classify::classify(&bytes) {
            Disposition::Tcp(meta) => self.send_segment(ts, &meta),
            _ => {
                if self.out_tx.send(OutputPacket { ts, data: bytes }).is_err() {
                    error!("output queue closed, dropping rebuilt datagram");
                }
            }
        }
    }

    fn send_segment(&mut self, ts: Duration, meta: &TcpMeta) {
        let seg = SegmentInput {
            flow: meta.flow.clone(),
            seq: meta.seq,
            flags: meta.flags,
            payload: meta.payload.to_vec(),
            ts,
        };
        if self.tcp_tx.send(seg).is_err() {
            error!("TCP queue closed, dropping segment");
        }
    }

    fn pass_through(&mut self, ts: Duration, data: Vec<u8>) {
        if self.out_tx.send(OutputPacket { ts, data }).is_err() {
            error!("output queue closed, dropping packet");
        } else {
            self.passed_through += 1;
        }
    }
}

fn assembly_loop(
    tcp_rx: Receiver<SegmentInput>,
    out_tx: Sender<OutputPacket>,
    queue_size: usize,
    max_flows: usize,
) -> u64 {
    let factory = SynthFactory {
        out_tx,
        queue_size,
        handles: Vec::new(),
    };
    let mut assembler = TcpStreamAssembler::new(factory, max_flows);
    for seg in tcp_rx.iter() {
        assembler.feed(seg);
    }
    assembler.close_all();
    assembler.into_factory().join_all()
}

/// Spawns one consumer thread per flow, each running framer + synthesizer.
struct SynthFactory {
    out_tx: Sender<OutputPacket>,
    queue_size: usize,
    handles: Vec<thread::JoinHandle<u64>>,
}

impl SynthFactory {
    fn join_all(self) -> u64 {
        let mut synthesized = 0;
        for handle in self.handles {
            match handle.join() {
                Ok(n) => synthesized += n,
                Err(_) => warn!("a stream consumer panicked"),
            }
        }
        synthesized
    }
}

impl StreamFactory for SynthFactory {
    fn start(&mut self, flow: &FiveTuple) -> Sender<StreamEvent> {
        let (tx, rx) = bounded(self.queue_size);
        let flow = flow.clone();
        let out_tx = self.out_tx.clone();
        let builder = thread::Builder::new().name(format!("flow {flow}"));
        match builder.spawn(move || consume_stream(flow, rx, out_tx)) {
            Ok(handle) => self.handles.push(handle),
            // rx is dropped: the assembler will see the dead channel and
            // drop the flow
            Err(e) => error!("could not spawn stream consumer: {e}"),
        }
        tx
    }
}

/// Per-flow consumer: frame the ordered byte stream and synthesize one UDP
/// packet per message. Runs until end-of-stream; a partial trailing frame
/// is normal termination, not an error.
fn consume_stream(flow: FiveTuple, rx: Receiver<StreamEvent>, out_tx: Sender<OutputPacket>) -> u64 {
    let mut framer = MessageFramer::new();
    let mut synthesized = 0;
    for event in rx.iter() {
        match event {
            StreamEvent::Data { ts, bytes } => {
                framer.feed(&bytes);
                while let Some(message) = framer.next_message() {
                    match synthesize(&flow, &message) {
                        Ok(data) => {
                            if out_tx.send(OutputPacket { ts, data }).is_ok() {
                                synthesized += 1;
                            }
                        }
                        Err(e) => warn!("dropping message from {flow}: {e}"),
                    }
                }
            }
            StreamEvent::Eof => break,
        }
    }
    synthesized
}

/// Sink task: write records in the order received.
fn sink_loop<W: Write>(output: W, rx: Receiver<OutputPacket>) -> Result<(usize, usize), Error> {
    let mut writer = PcapWriter::new(output);
    if let Err(e) = writer.init_file(OUTPUT_SNAPLEN, OUTPUT_LINKTYPE) {
        // drain so producers never block on a dead sink
        for _ in rx.iter() {}
        return Err(e);
    }
    let mut written = 0;
    let mut errors = 0;
    for packet in rx.iter() {
        match writer.write_packet(&packet) {
            Ok(_) => written += 1,
            Err(e) => {
                warn!("error writing record: {e}");
                errors += 1;
            }
        }
    }
    info!("wrote {written} records ({errors} errors)");
    Ok((written, errors))
}
