use bond_net::{Client, Connection, LinkConfig, Listener, PeerHooks, PeerState};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

mod common;
use common::{Sample, WAIT, registry, wait_until};

fn start(config: LinkConfig) -> (Arc<Listener>, Arc<AtomicUsize>) {
    let listener = Listener::bind("127.0.0.1:0", registry(), config).unwrap();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    listener.on_disconnect.set(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    listener.listen().unwrap();
    (listener, disconnects)
}

#[test]
fn silent_peer_is_dropped_after_keep_alive() {
    let config = LinkConfig::default().with_keep_alive(Duration::from_millis(300));
    let (listener, disconnects) = start(config);
    let client = Client::new(listener.local_addr().to_string(), registry(), LinkConfig::default());
    let connection = client.connect().unwrap();
    assert!(wait_until(WAIT, || listener.peers().len() == 1));

    assert!(wait_until(WAIT, || disconnects.load(Ordering::SeqCst) == 1));
    assert!(listener.peers().is_empty());
    // the client sees the server hang up
    assert!(wait_until(WAIT, || connection.state() != PeerState::Open));
}

#[test]
fn chatty_peer_stays_connected() {
    let config = LinkConfig::default().with_keep_alive(Duration::from_millis(300));
    let (listener, disconnects) = start(config);
    let client = Client::new(listener.local_addr().to_string(), registry(), LinkConfig::default());
    client.connect().unwrap();

    for _ in 0..12 {
        assert!(client.send_packet(Sample::new("still here")));
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    assert_eq!(listener.peers().len(), 1);
    client.close();
    listener.close();
}

struct Heartbeat;

impl PeerHooks<Connection> for Heartbeat {
    fn on_idle(&self, connection: &Connection, idle: Duration) {
        if idle > Duration::from_millis(100) {
            connection.send_packet(&Sample::new("heartbeat"));
        }
    }
}

#[test]
fn idle_hook_can_keep_a_peer_alive() {
    let config = LinkConfig::default()
        .with_keep_alive(Duration::from_millis(300))
        .with_sweep_interval(Duration::from_millis(20));
    let (listener, disconnects) = start(config);
    listener.set_connection_factory(|stream, registry, config| {
        Connection::with_hooks(stream, registry.clone(), config, Arc::new(Heartbeat))
    });

    let client = Client::new(listener.local_addr().to_string(), registry(), LinkConfig::default());
    let connection = client.connect().unwrap();
    assert!(wait_until(WAIT, || connection.pending_packets() > 0));
    // well past the keep-alive; only the heartbeats count as activity
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    assert_eq!(listener.peers().len(), 1);
    client.close();
    listener.close();
}

#[test]
fn silent_peer_is_reported_within_one_sweep_of_the_timeout() {
    let keep_alive = Duration::from_millis(200);
    let sweep = Duration::from_millis(20);
    let config = LinkConfig::default().with_keep_alive(keep_alive).with_sweep_interval(sweep);
    let (listener, disconnects) = start(config);
    // the sweep is now parked on the idle interval
    std::thread::sleep(Duration::from_millis(100));

    let client = Client::new(listener.local_addr().to_string(), registry(), LinkConfig::default());
    let started = Instant::now();
    client.connect().unwrap();
    assert!(wait_until(WAIT, || disconnects.load(Ordering::SeqCst) == 1));
    let elapsed = started.elapsed();
    assert!(elapsed >= keep_alive, "reported early after {elapsed:?}");
    assert!(elapsed < keep_alive + sweep + Duration::from_millis(150), "reported late after {elapsed:?}");
    client.close();
    listener.close();
}
