use bond_net::{
    Compression, LinkConfig, Listener, Packet, PacketReader, PacketRegistry, PacketWriter, Peer, Result, Session,
    SessionClient,
};
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::filter::EnvFilter;

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

fn config(args: &Args) -> LinkConfig {
    let config = LinkConfig::default().with_link_count(args.bond as usize);
    if args.compress { config.with_compression(Compression::enabled(args.size / 2)) } else { config }
}

fn run_client_mode(args: Args) {
    let client = SessionClient::new(args.addr.clone(), registry(), config(&args));
    let session = client.connect().unwrap();
    println!("Connected successfully to {} over {} links", args.addr, session.link_count());

    let payload = bytes::Bytes::from(vec![42u8; args.size]);
    loop {
        if !client.send_packet(Blob { data: payload.clone() }) {
            println!("Connection closed by remote peer");
            break;
        }
    }
}

fn report(cid: usize, session: Arc<Session>, received: Arc<AtomicUsize>, period: Duration) {
    let mut start = Instant::now();
    while session.is_available() {
        std::thread::sleep(period);
        let delta = start.elapsed();
        let total = received.swap(0, Ordering::Relaxed);
        let throughput = ((total * 8) as f32 / delta.as_secs_f32()) / (10u64.pow(6) as f32);
        println!("[{cid}]: {throughput} Mbps over {} links", session.link_count());
        start = Instant::now();
    }
}

fn run_server_mode(args: Args) {
    let listener = Listener::bind(args.addr.clone(), registry(), config(&args)).unwrap();
    let sid = Arc::new(AtomicUsize::new(0));
    let period = Duration::from_secs(args.period);
    listener.on_accept.set(move |peer| {
        let Peer::Bonded(session) = peer else {
            println!("Ignoring plain connection {peer:?}");
            return;
        };
        let cid = sid.fetch_add(1, Ordering::Relaxed);
        println!("Accepted session {} as [{cid}]", session.id());
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        session.set_packet_handler(move |_: &Session, packet: Box<dyn Packet>| {
            if let Some(blob) = packet.downcast_ref::<Blob>() {
                counter.fetch_add(blob.data.len(), Ordering::Relaxed);
            }
        });
        let session = session.clone();
        std::thread::spawn(move || report(cid, session, received, period));
    });
    listener.on_disconnect.set(|peer| println!("Session closed by remote party: {peer:?}"));
    listener.listen().unwrap();
    println!("Listening on {}", listener.local_addr());
    loop {
        std::thread::park();
    }
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() {
    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    if args.client {
        run_client_mode(args);
    } else {
        run_server_mode(args);
    }
}

/// Packet throughput over a bonded session
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
    /// The number of links to bond
    #[arg(short, long, default_value = "4")]
    bond: u8,
    /// The sampling period in seconds
    #[arg(short, long, default_value = "1")]
    period: u64,
    /// Compress packets larger than half the payload size
    #[arg(long)]
    compress: bool,
}
