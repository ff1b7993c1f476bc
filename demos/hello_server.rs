use bond_net::{
    Connection, LinkConfig, Listener, Packet, PacketReader, PacketRegistry, PacketWriter, Peer, Result, Session,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[derive(Debug, Default)]
struct Hello {
    data: String,
}

impl Packet for Hello {
    fn key(&self) -> u32 {
        0
    }

    fn write(&self, w: &mut PacketWriter) -> Result<()> {
        w.write_string(&self.data)?;
        Ok(())
    }

    fn read(&mut self, r: &mut PacketReader) -> Result<()> {
        self.data = r.read_string()?;
        Ok(())
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

fn answer(packet: Box<dyn Packet>) -> Option<Hello> {
    let hello = packet.downcast_ref::<Hello>()?;
    info!("received {:?}", hello.data);
    Some(Hello { data: format!("{} back", hello.data) })
}

fn main() -> bond_net::Result<()> {
    // Initialize log bridge to capture log crate messages - MUST be first!
    tracing_log::LogTracer::init().expect("Failed to set logger");

    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    let registry = PacketRegistry::new();
    registry.register::<Hello>()?;
    let config = LinkConfig::default()
        .with_link_count(args.links)
        .with_keep_alive(Duration::from_secs(args.keep_alive));

    let listener = Listener::bind(args.listen.as_str(), Arc::new(registry), config)?;
    listener.on_accept.set(|peer| {
        println!("Accepted {peer:?}");
        match peer {
            Peer::Single(c) => c.set_packet_handler(|c: &Connection, p: Box<dyn Packet>| {
                if let Some(a) = answer(p) {
                    c.send_packet(&a);
                }
            }),
            Peer::Bonded(s) => s.set_packet_handler(|s: &Session, p: Box<dyn Packet>| {
                if let Some(a) = answer(p) {
                    s.send_packet(&a);
                }
            }),
        }
    });
    listener.on_disconnect.set(|peer| println!("Disconnected {peer:?}"));
    listener.listen()?;
    println!("Listening on {}, bonding up to {} links", listener.local_addr(), args.links);
    loop {
        std::thread::park();
    }
}

/// A simple server answering every hello it receives.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The address to listen on in the format <ip:port>
    #[arg(short, long, default_value = "127.0.0.1:7890")]
    listen: String,
    /// The maximum number of links granted per session
    #[arg(short = 'n', long, default_value = "3")]
    links: usize,
    /// Disconnect peers idle for this many seconds, 0 to never
    #[arg(short, long, default_value = "0")]
    keep_alive: u64,
}
