use std::fs::File;
use std::io;

use clap::{crate_version, Arg, ArgAction, Command};
use log::info;

use pcap_udpify::{pcap_to_udp_file, Config};

fn main() -> io::Result<()> {
    let matches = Command::new("pcap-udpify")
        .version(crate_version!())
        .about("Rewrite DNS-over-TCP in a pcap file as checksum-correct UDP packets")
        .arg(
            Arg::new("config")
                .help("Configuration file")
                .short('c')
                .long("config"),
        )
        .arg(
            Arg::new("verbose")
                .help("Increase verbosity (may be used multiple times)")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("INPUT")
                .help("Input capture file (pcap or pcap-ng)")
                .required(true),
        )
        .arg(
            Arg::new("OUTPUT")
                .help("Output file (legacy pcap, raw IP link type)")
                .required(true),
        )
        .get_matches();

    let verbosity = matches.get_count("verbose");
    init_logger(verbosity);

    let mut config = Config::default();
    if let Some(path) = matches.get_one::<String>("config") {
        let file = File::open(path)?;
        config.load_config(file)?;
    }

    let input = matches
        .get_one::<String>("INPUT")
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "missing input file name"))?;
    let output = matches
        .get_one::<String>("OUTPUT")
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "missing output file name"))?;

    let stats = pcap_to_udp_file(input, output, &config)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    info!(
        "done: {} packets read, {} passed through, {} datagrams reassembled, {} messages synthesized, {} records written",
        stats.packets_read,
        stats.passed_through,
        stats.datagrams_reassembled,
        stats.messages_synthesized,
        stats.records_written
    );
    if stats.write_errors > 0 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} records could not be written", stats.write_errors),
        ));
    }
    Ok(())
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::SimpleLogger::init(level, simplelog::Config::default());
}
