/// Capture timestamp, seconds + microseconds since the epoch.
///
/// Partial reimplementation of std::time::Duration: panic-free, fields
/// exposed, micros instead of nanos to match pcap record headers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Duration {
    pub secs: u32,
    pub micros: u32,
}

impl Duration {
    pub fn new(secs: u32, micros: u32) -> Duration {
        Duration { secs, micros }
    }
}
