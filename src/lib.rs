//! Rewrite captured DNS-over-TCP traffic as self-contained UDP packets.
//!
//! The library reads a pcap or pcap-ng capture, reassembles fragmented
//! IPv4/IPv6 datagrams and TCP byte streams, splits each stream into
//! length-prefixed messages, and writes a legacy pcap file where every
//! message is a single synthetic UDP packet. Everything that is not TCP
//! or an IP fragment passes through unchanged.

mod classify;
mod config;
mod defrag;
mod duration;
mod error;
mod five_tuple;
mod framer;
mod ip6_defrag;
mod packet;
mod pcap;
mod pipeline;
mod rebuild;
mod synth;
mod tcp_reassembly;

pub use config::Config;
pub use error::Error;
pub use pipeline::{pcap_to_udp, Stats};

use std::fs::File;
use std::path::Path;

/// Convenience wrapper around [`pcap_to_udp`] for on-disk captures.
pub fn pcap_to_udp_file<P: AsRef<Path>>(
    input: P,
    output: P,
    config: &Config,
) -> Result<Stats, Error> {
    let input = File::open(input)?;
    let output = File::create(output)?;
    pcap_to_udp(input, output, config)
}
