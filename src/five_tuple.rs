use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Directed flow identity: protocol, endpoints and ports as seen on the wire.
///
/// TCP reassembly keys its state on the directed tuple: each direction of a
/// connection is an independent byte stream with its own framing.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FiveTuple {
    pub proto: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Default for FiveTuple {
    fn default() -> Self {
        FiveTuple {
            proto: 0,
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} [{}]",
            self.src, self.src_port, self.dst, self.dst_port, self.proto
        )
    }
}
