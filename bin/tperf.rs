use bond_net::{Client, Connection, LinkConfig, Listener, Packet, PacketReader, PacketRegistry, PacketWriter, Peer, Result};
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Blob {
    data: bytes::Bytes,
}

impl Packet for Blob {
    fn key(&self) -> u32 {
        1
    }

    fn write(&self, w: &mut PacketWriter) -> Result<()> {
        w.write_bytes(&self.data)?;
        Ok(())
    }

    fn read(&mut self, r: &mut PacketReader) -> Result<()> {
        self.data = r.read_bytes()?;
        Ok(())
    }
}

fn registry() -> Arc<PacketRegistry> {
    let registry = PacketRegistry::new();
    registry.register::<Blob>().expect("blob key is free");
    Arc::new(registry)
}

fn run_client_mode(args: Args) {
    let client = Client::new(args.addr.clone(), registry(), LinkConfig::default());
    client.connect().unwrap();
    println!("Connected successfully to {}", args.addr);

    let payload = bytes::Bytes::from(vec![42u8; args.size]);
    loop {
        if !client.send_packet(Blob { data: payload.clone() }) {
            println!("Connection closed by remote peer");
            break;
        }
    }
}

fn run_server_mode(args: Args) {
    let listener = Listener::bind(args.addr.clone(), registry(), LinkConfig::default()).unwrap();
    let sid = Arc::new(AtomicUsize::new(0));
    let sampling_period = Duration::from_secs(args.period);
    listener.on_accept.set(move |peer| {
        let Peer::Single(connection) = peer else {
            return;
        };
        let cid = sid.fetch_add(1, Ordering::Relaxed);
        println!("Accepted connection from: {:?}", connection.peer_addr());
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        connection.set_packet_handler(move |_: &Connection, packet: Box<dyn Packet>| {
            if let Some(blob) = packet.downcast_ref::<Blob>() {
                counter.fetch_add(blob.data.len(), Ordering::Relaxed);
            }
        });
        let connection = connection.clone();
        std::thread::spawn(move || {
            let mut start = Instant::now();
            while connection.is_available() {
                std::thread::sleep(sampling_period);
                let delta = start.elapsed();
                let total_recv = received.swap(0, Ordering::Relaxed);
                let throughput = ((total_recv * 8) as f32 / delta.as_secs_f32()) / (10u64.pow(6) as f32);
                println!("[{cid}]: {throughput} Mbps");
                start = Instant::now();
            }
            println!("Socket close from remote party...");
        });
    });
    listener.listen().unwrap();
    loop {
        std::thread::park();
    }
}

fn main() {
    let args = Args::parse();
    if args.client {
        run_client_mode(args);
    } else {
        run_server_mode(args);
    }
}

/// Packet throughput over a single plain connection
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Set the client mode for the application
    #[arg(short, long)]
    client: bool,
    /// The address <ip:port> to listen or connect, depending on the mode.
    #[arg(short, long)]
    addr: String,
    /// The payload size of each packet
    #[arg(short, long)]
    size: usize,
    /// The sampling period in seconds
    #[arg(short, long, default_value = "1")]
    period: u64,
}
