use anyhow::Result;
use clap::Parser;
use log::info;
use ndn_pdump::face::mem::{ethernet_frame, MemDataplane, MemFace, MemPort};
use ndn_pdump::filter::NameFilterEntry;
use ndn_pdump::ndn::{Data, Interest, Name, Packet};
use ndn_pdump::{FaceConfig, PortConfig, Registry, Writer, WriterConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
struct Opt {
    /// Output pcapng file.
    #[clap(short = 'o', default_value = "capture.pcapng")]
    output: String,

    #[clap(long, default_value = "16777216")]
    max_size: u64,

    /// Name prefix to sample on the face.
    #[clap(short = 'n', default_value = "/")]
    prefix: String,

    #[clap(long, default_value = "0.8")]
    rx_probability: f64,

    #[clap(long, default_value = "0.3")]
    tx_probability: f64,

    /// Also mirror unmatched frames from a port.
    #[clap(long)]
    port: bool,

    /// Stop after this many Interest/Data exchanges. 0 runs until Ctrl-C.
    #[clap(short = 'c', default_value = "2048")]
    count: u64,

    #[clap(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("ndn_pdump")
        .module("capture")
        .verbosity(opt.verbose as usize + 1)
        .init()
        .unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    ctrlc::set_handler(move || {
        eprintln!("Received SIGINT signal, shutting down...");
        d.store(true, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let dp = Arc::new(MemDataplane::new());
    let face = dp.add_face(MemFace::new(1, "mem://demo"));
    let port = dp.add_port(MemPort::new(0, "demo0"));
    let reg = Registry::new(dp.clone());
    let watcher = reg.watch(dp.subscribe())?;
    reg.add_writer(
        "demo",
        Writer::new(WriterConfig {
            max_size: opt.max_size,
            ..WriterConfig::new(&opt.output)
        })?,
    );

    let prefix = Name::new(&opt.prefix)?;
    let mut sources = vec![
        reg.attach_face(&FaceConfig {
            writer: "demo".to_string(),
            face: 1,
            dir: "incoming".to_string(),
            names: vec![NameFilterEntry::new(prefix.clone(), opt.rx_probability)],
        })?,
        reg.attach_face(&FaceConfig {
            writer: "demo".to_string(),
            face: 1,
            dir: "outgoing".to_string(),
            names: vec![NameFilterEntry::new(prefix.clone(), opt.tx_probability)],
        })?,
    ];
    if opt.port {
        sources.push(reg.attach_port(&PortConfig {
            writer: "demo".to_string(),
            port: 0,
            grab: "RxUnmatched".to_string(),
        })?);
    }

    let mut n = 0u64;
    while !done.load(Ordering::SeqCst) && (opt.count == 0 || n < opt.count) {
        let name = prefix.append(n.to_string());
        let interest = Packet::Interest(Interest::new(name.clone(), rand::random()));
        face.send(&interest);
        face.receive(&Packet::Data(Data::new(name, format!("data {n}").into_bytes())));
        if opt.port {
            port.receive_unmatched(&ethernet_frame([0xFF; 6], [2, 0, 0, 0, 0, 1], &interest.serialize()));
        }
        n += 1;
        if opt.count == 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    // Face going away detaches its sources; close the rest by hand.
    dp.remove_face(1);
    for src in &sources {
        src.close()?;
    }
    let writer = reg.writer("demo").expect("writer registered above");
    reg.remove_writer("demo")?;
    let stats = writer.stats();
    info!(
        "{n} exchanges: {} packets written, {} dropped, {} bytes in {}",
        stats.packets,
        stats.dropped,
        stats.bytes,
        opt.output
    );
    drop(reg);
    drop(dp);
    watcher.join().expect("watch thread panicked");
    Ok(())
}
