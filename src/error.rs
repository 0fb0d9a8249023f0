use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Generic(&'static str),
    /// Building a rebuilt or synthetic packet failed
    #[error("serialization error: {0}")]
    Serialize(&'static str),
    // PcapError borrows the input buffer, keep only the message
    #[error("pcap parse error: {0}")]
    Pcap(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl<I: std::fmt::Debug> From<pcap_parser::PcapError<I>> for Error {
    fn from(e: pcap_parser::PcapError<I>) -> Self {
        Error::Pcap(format!("{e:?}"))
    }
}
