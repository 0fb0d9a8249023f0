use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::num::Wrapping;

use crossbeam_channel::Sender;
use log::{debug, trace, warn};
use pnet_packet::tcp::TcpFlags;

use crate::duration::Duration;
use crate::five_tuple::FiveTuple;

pub const DEFAULT_MAX_FLOWS: usize = 4096;

/// One decoded TCP segment, owning its payload so it can cross the
/// reader / assembly task boundary.
#[derive(Debug)]
pub struct SegmentInput {
    pub flow: FiveTuple,
    pub seq: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
    pub ts: Duration,
}

/// Events delivered to a per-flow consumer: a maximal gap-free run of
/// stream bytes, or end of stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data { ts: Duration, bytes: Vec<u8> },
    Eof,
}

/// Spawns the consumer side of a flow. Called once per directed flow, on
/// its first segment; returns the sending end of the flow's event channel.
pub trait StreamFactory {
    fn start(&mut self, flow: &FiveTuple) -> Sender<StreamEvent>;
}

/// Wraparound-safe strict ordering on the 32-bit sequence space.
fn seq_before(a: Wrapping<u32>, b: Wrapping<u32>) -> bool {
    ((b - a).0 as i32) > 0
}

/// Out-of-order payload, positioned by relative sequence number.
struct Segment {
    rel_seq: Wrapping<u32>,
    data: Vec<u8>,
    ts: Duration,
}

struct FlowState {
    tx: Sender<StreamEvent>,
    /// initial sequence number; data bytes start here (SYN consumed)
    isn: Wrapping<u32>,
    /// next byte offset to release, relative to isn
    next_rel_seq: Wrapping<u32>,
    /// buffered out-of-order segments, sorted by rel_seq
    segments: VecDeque<Segment>,
    /// relative seq one past the last data byte, once FIN was seen
    fin_rel_seq: Option<Wrapping<u32>>,
    last_activity: u64,
}

impl FlowState {
    fn insert_sorted(&mut self, s: Segment) {
        for (n, item) in self.segments.iter().enumerate() {
            if seq_before(s.rel_seq, item.rel_seq) {
                self.segments.insert(n, s);
                return;
            }
        }
        self.segments.push_back(s);
    }

    /// Release the maximal gap-free prefix to the consumer.
    /// Returns false if the consumer is gone.
    fn drain(&mut self) -> bool {
        while let Some(front) = self.segments.front() {
            if seq_before(self.next_rel_seq, front.rel_seq) {
                // gap
                break;
            }
            let Some(mut seg) = self.segments.pop_front() else {
                break;
            };
            // duplicate or retransmitted prefix
            let skip = (self.next_rel_seq - seg.rel_seq).0 as usize;
            if skip >= seg.data.len() {
                continue;
            }
            let bytes = if skip > 0 {
                seg.data.split_off(skip)
            } else {
                seg.data
            };
            self.next_rel_seq += Wrapping(bytes.len() as u32);
            if self.tx.send(StreamEvent::Data { ts: seg.ts, bytes }).is_err() {
                return false;
            }
        }
        true
    }

    /// True once the FIN point was reached and everything before it was
    /// delivered.
    fn finished(&self) -> bool {
        match self.fin_rel_seq {
            Some(fin) => !seq_before(self.next_rel_seq, fin),
            None => false,
        }
    }
}

/// Ordered TCP stream reassembly for all flows of a capture.
///
/// One engine processes all segments in capture order, keyed by the
/// *directed* five-tuple; each direction of a connection is its own byte
/// stream. Within a flow, bytes are released to the consumer in strictly
/// increasing offset order, exactly once each. The flow table is bounded;
/// on overflow the stalest flow is force-closed (added policy, see config).
pub struct TcpStreamAssembler<F: StreamFactory> {
    flows: HashMap<FiveTuple, FlowState>,
    factory: F,
    max_flows: usize,
    clock: u64,
}

impl<F: StreamFactory> TcpStreamAssembler<F> {
    pub fn new(factory: F, max_flows: usize) -> Self {
        TcpStreamAssembler {
            flows: HashMap::new(),
            factory,
            max_flows,
            clock: 0,
        }
    }

    pub fn feed(&mut self, seg: SegmentInput) {
        self.clock += 1;
        let clock = self.clock;

        if seg.flags & TcpFlags::RST != 0 {
            // reset tears the stream down immediately, buffered
            // out-of-order data is discarded
            if let Some(state) = self.flows.remove(&seg.flow) {
                debug!("RST: closing stream {}", seg.flow);
                let _ = state.tx.send(StreamEvent::Eof);
            }
            return;
        }

        if !self.flows.contains_key(&seg.flow) && self.flows.len() >= self.max_flows {
            self.force_close_stalest();
        }
        let state = match self.flows.entry(seg.flow.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                trace!("new TCP stream {}", seg.flow);
                let tx = self.factory.start(&seg.flow);
                // without a SYN (capture started mid-connection) the stream
                // is picked up on the fly at the first seen sequence number
                let isn = Wrapping(seg.seq) + Wrapping(u32::from(seg.flags & TcpFlags::SYN != 0));
                e.insert(FlowState {
                    tx,
                    isn,
                    next_rel_seq: Wrapping(0),
                    segments: VecDeque::new(),
                    fin_rel_seq: None,
                    last_activity: clock,
                })
            }
        };
        state.last_activity = clock;

        // payload bytes start one past the SYN
        let syn = u32::from(seg.flags & TcpFlags::SYN != 0);
        let rel_seq = Wrapping(seg.seq) + Wrapping(syn) - state.isn;

        let payload_len = seg.payload.len() as u32;
        if !seg.payload.is_empty() {
            state.insert_sorted(Segment {
                rel_seq,
                data: seg.payload,
                ts: seg.ts,
            });
        }
        if seg.flags & TcpFlags::FIN != 0 {
            state.fin_rel_seq = Some(rel_seq + Wrapping(payload_len));
        }

        let alive = state.drain();
        if !alive {
            warn!("stream consumer for {} is gone, dropping flow", seg.flow);
            self.flows.remove(&seg.flow);
            return;
        }
        if state.finished() {
            debug!("FIN: closing stream {}", seg.flow);
            if let Some(state) = self.flows.remove(&seg.flow) {
                let _ = state.tx.send(StreamEvent::Eof);
            }
        }
    }

    /// Recover the factory, e.g. to join spawned consumers after
    /// [`close_all`](Self::close_all).
    pub fn into_factory(self) -> F {
        self.factory
    }

    /// End of capture: flush every flow's in-order data and signal all
    /// consumers end-of-stream.
    pub fn close_all(&mut self) {
        debug!("closing {} remaining TCP streams", self.flows.len());
        for (flow, mut state) in self.flows.drain() {
            if state.drain() {
                let _ = state.tx.send(StreamEvent::Eof);
            } else {
                warn!("stream consumer for {flow} exited early");
            }
        }
    }

    fn force_close_stalest(&mut self) {
        if let Some(flow) = self
            .flows
            .iter()
            .min_by_key(|(_, s)| s.last_activity)
            .map(|(f, _)| f.clone())
        {
            warn!("flow table full, force-closing stalest stream {flow}");
            if let Some(mut state) = self.flows.remove(&flow) {
                state.drain();
                let _ = state.tx.send(StreamEvent::Eof);
            }
        }
    }
}
