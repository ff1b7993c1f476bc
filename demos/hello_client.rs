use bond_net::{LinkConfig, Packet, PacketReader, PacketRegistry, PacketWriter, Result, Session, SessionClient};
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
        .with_connect_timeout(Duration::from_secs(5));

    let client = SessionClient::new(args.connect, Arc::new(registry), config);
    client.on_connect_failed().set(|e| println!("Connect failed: {e}"));
    client.on_disconnect().set(|s| println!("Session {} closed", s.id()));

    // queued until the session is negotiated
    client.send_packet(Hello { data: "hi".into() });
    let session = client.connect()?;
    println!("Connected successfully over {} of {} links", session.link_count(), session.expected_links());
    session.set_packet_handler(|_: &Session, packet: Box<dyn Packet>| {
        if let Some(hello) = packet.downcast_ref::<Hello>() {
            info!("server said {:?}", hello.data);
        }
    });

    for n in 0.. {
        if !client.send_packet(Hello { data: format!("hi #{n}") }) {
            break;
        }
        std::thread::sleep(Duration::from_millis(args.period));
    }
    Ok(())
}

/// A simple client illustrating the use of socket bonding.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The server address to connect to in the format <ip:port>
    #[arg(short, long, default_value = "127.0.0.1:7890")]
    connect: String,
    /// The number of links to ask for
    #[arg(short = 'n', long, default_value = "3")]
    links: usize,
    /// Pause between packets in milliseconds
    #[arg(short, long, default_value = "1000")]
    period: u64,
}
