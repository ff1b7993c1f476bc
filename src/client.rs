//! Connecting side: single-link [`Client`] and bonded [`SessionClient`].
//!
//! Both queue packets sent before the connection is up and flush them, in
//! order, the moment it is established. A background updater drives
//! keep-alive and raises `on_disconnect` once the peer becomes unavailable.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::connection::{Connection, ConnectionFactory, default_connection_factory};
use crate::error::{NetError, Result};
use crate::events::EventSlot;
use crate::handshake::{Control, PendingBond};
use crate::packet::Packet;
use crate::registry::PacketRegistry;
use crate::session::{Session, SessionFactory, default_session_factory};
use crate::transport;

/// What a client drives once connected.
trait Remote: Send + Sync + std::fmt::Debug + 'static {
    fn send_packet(&self, packet: &dyn Packet) -> bool;
    fn is_available(&self) -> bool;
    fn update(&self, now: Instant);
    fn close(&self);
}

impl Remote for Connection {
    fn send_packet(&self, packet: &dyn Packet) -> bool {
        Connection::send_packet(self, packet)
    }

    fn is_available(&self) -> bool {
        Connection::is_available(self)
    }

    fn update(&self, now: Instant) {
        Connection::update(self, now)
    }

    fn close(&self) {
        Connection::close(self)
    }
}

impl Remote for Session {
    fn send_packet(&self, packet: &dyn Packet) -> bool {
        Session::send_packet(self, packet)
    }

    fn is_available(&self) -> bool {
        Session::is_available(self)
    }

    fn update(&self, now: Instant) {
        Session::update(self, now)
    }

    fn close(&self) {
        Session::close(self)
    }
}

enum Phase<T> {
    /// Not connected yet; sends are queued.
    Idle,
    Connected(Arc<T>),
    /// The peer went away; sends fail until the next connect.
    Ended,
}

struct DialState<T> {
    phase: Phase<T>,
    pending: VecDeque<Box<dyn Packet>>,
    /// The queue is being drained onto a fresh peer; new sends join the queue.
    flushing: bool,
}

/// State and events shared by both client kinds.
struct Dialer<T: Remote> {
    endpoint: String,
    registry: Arc<PacketRegistry>,
    config: LinkConfig,
    state: Mutex<DialState<T>>,
    closed: AtomicBool,
    updater: AtomicBool,
    wake: Mutex<()>,
    wake_cv: Condvar,
    on_connected: EventSlot<T>,
    on_connect_failed: EventSlot<NetError>,
    on_disconnect: EventSlot<T>,
}

impl<T: Remote> Dialer<T> {
    fn new(endpoint: String, registry: Arc<PacketRegistry>, config: LinkConfig) -> Self {
        Self {
            endpoint,
            registry,
            config,
            state: Mutex::new(DialState { phase: Phase::Idle, pending: VecDeque::new(), flushing: false }),
            closed: AtomicBool::new(false),
            updater: AtomicBool::new(false),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
            on_connected: EventSlot::new(),
            on_connect_failed: EventSlot::new(),
            on_disconnect: EventSlot::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn current(&self) -> Option<Arc<T>> {
        match &self.state.lock().phase {
            Phase::Connected(peer) => Some(peer.clone()),
            _ => None,
        }
    }

    fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn send<P: Packet>(&self, packet: P) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut state = self.state.lock();
        match &state.phase {
            Phase::Connected(_) if state.flushing => {
                state.pending.push_back(Box::new(packet));
                true
            }
            Phase::Connected(peer) => {
                let peer = peer.clone();
                drop(state);
                peer.send_packet(&packet)
            }
            Phase::Idle => {
                state.pending.push_back(Box::new(packet));
                true
            }
            Phase::Ended => false,
        }
    }

    /// Runs `dial` unless already connected; reports the outcome through the events.
    fn connect(self: &Arc<Self>, dial: impl FnOnce(&Self) -> Result<Arc<T>>) -> Result<Arc<T>> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        {
            let mut state = self.state.lock();
            match &state.phase {
                Phase::Connected(peer) => return Ok(peer.clone()),
                Phase::Ended => state.phase = Phase::Idle,
                Phase::Idle => {}
            }
        }
        match dial(self.as_ref()) {
            Ok(peer) => {
                if self.is_closed() {
                    peer.close();
                    return Err(NetError::Closed);
                }
                log::debug!("connected to {}: {peer:?}", self.endpoint);
                self.on_connected.emit(&peer);
                self.start_updater()?;
                Ok(peer)
            }
            Err(e) => {
                log::debug!("connect to {} failed: {}", self.endpoint, e.root_cause());
                self.on_connect_failed.emit(&e);
                Err(e)
            }
        }
    }

    /// Makes `peer` current and drains the queue onto it in order.
    ///
    /// Sends made while draining are queued behind the backlog. No lock is
    /// held while a packet is written, so peer hooks may call back in.
    fn establish(&self, peer: &Arc<T>) {
        {
            let mut state = self.state.lock();
            state.phase = Phase::Connected(peer.clone());
            state.flushing = true;
        }
        let mut flushed = 0usize;
        loop {
            let packet = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(packet) => packet,
                    None => {
                        state.flushing = false;
                        break;
                    }
                }
            };
            if !peer.send_packet(packet.as_ref()) {
                log::debug!("queued packet {} was not delivered", packet.key());
            }
            flushed += 1;
        }
        if flushed > 0 {
            log::debug!("flushed {flushed} queued packets to {}", self.endpoint);
        }
    }

    fn start_updater(self: &Arc<Self>) -> Result<()> {
        if self.updater.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let this = self.clone();
        thread::Builder::new()
            .name("bond-client-sweep".into())
            .spawn(move || this.update_loop())?;
        Ok(())
    }

    fn update_loop(self: Arc<Self>) {
        while !self.is_closed() {
            self.sweep(Instant::now());
            let interval = if self.current().is_some() {
                self.config.sweep_interval
            } else {
                self.config.idle_sweep_interval
            };
            let mut guard = self.wake.lock();
            if self.is_closed() {
                break;
            }
            self.wake_cv.wait_for(&mut guard, interval);
        }
    }

    fn sweep(&self, now: Instant) {
        let Some(peer) = self.current() else {
            return;
        };
        peer.update(now);
        if peer.is_available() {
            return;
        }
        {
            let mut state = self.state.lock();
            match &state.phase {
                Phase::Connected(current) if Arc::ptr_eq(current, &peer) => {
                    state.phase = Phase::Ended;
                    state.flushing = false;
                }
                _ => return,
            }
        }
        log::debug!("disconnected from {}", self.endpoint);
        self.on_disconnect.emit(&peer);
        peer.close();
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let peer = {
            let mut state = self.state.lock();
            state.pending.clear();
            state.flushing = false;
            match std::mem::replace(&mut state.phase, Phase::Ended) {
                Phase::Connected(peer) => Some(peer),
                _ => None,
            }
        };
        if let Some(peer) = peer {
            peer.close();
        }
        let _guard = self.wake.lock();
        self.wake_cv.notify_all();
    }
}

/// A client holding one plain [`Connection`].
///
/// ```no_run
/// use bond_net::{Client, LinkConfig, PacketRegistry};
/// use std::sync::Arc;
///
/// let client = Client::new("127.0.0.1:9000", Arc::new(PacketRegistry::new()), LinkConfig::default());
/// client.on_connected().set(|c| println!("connected to {:?}", c.peer_addr()));
/// let connection = client.connect()?;
/// # Ok::<(), bond_net::NetError>(())
/// ```
pub struct Client {
    dialer: Arc<Dialer<Connection>>,
    factory: RwLock<ConnectionFactory>,
}

impl Client {
    /// Creates an unconnected client for `endpoint` (`host:port`).
    pub fn new(endpoint: impl Into<String>, registry: Arc<PacketRegistry>, config: LinkConfig) -> Arc<Self> {
        Arc::new(Self {
            dialer: Arc::new(Dialer::new(endpoint.into(), registry, config)),
            factory: RwLock::new(default_connection_factory()),
        })
    }

    /// Replaces how the [`Connection`] is built on the next connect, e.g. to
    /// install [`PeerHooks`](crate::PeerHooks).
    pub fn set_connection_factory(
        &self,
        factory: impl Fn(TcpStream, &Arc<PacketRegistry>, &LinkConfig) -> Result<Arc<Connection>> + Send + Sync + 'static,
    ) {
        *self.factory.write() = Arc::new(factory);
    }

    /// Connects and announces a plain connection, blocking until done.
    ///
    /// Returns the current connection when already connected.
    pub fn connect(&self) -> Result<Arc<Connection>> {
        let factory = self.factory.read().clone();
        self.dialer.connect(|dialer| {
            let stream = transport::connect(&dialer.endpoint, dialer.config.connect_timeout)?;
            let mut pending = PendingBond::new(stream);
            pending.send(&Control::Plain)?;
            let (stream, seed) = pending.into_parts();
            let connection = factory(stream, &dialer.registry, &dialer.config)?;
            connection.begin_receive(seed)?;
            dialer.establish(&connection);
            Ok(connection)
        })
    }

    /// Sends `packet`, or queues it when not connected yet.
    ///
    /// Returns `false` if the client is closed, the connection has gone away,
    /// or the send failed.
    pub fn send_packet<P: Packet>(&self, packet: P) -> bool {
        self.dialer.send(packet)
    }

    /// The current connection, if connected.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.dialer.current()
    }

    /// Connected and still available.
    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_available())
    }

    /// Packets waiting for the connection.
    pub fn pending_packets(&self) -> usize {
        self.dialer.pending()
    }

    /// The address this client dials.
    pub fn endpoint(&self) -> &str {
        &self.dialer.endpoint
    }

    /// Raised after every successful connect.
    pub fn on_connected(&self) -> &EventSlot<Connection> {
        &self.dialer.on_connected
    }

    /// Raised with the error when a connect fails.
    pub fn on_connect_failed(&self) -> &EventSlot<NetError> {
        &self.dialer.on_connect_failed
    }

    /// Raised once when the connection becomes unavailable, before it is closed.
    pub fn on_disconnect(&self) -> &EventSlot<Connection> {
        &self.dialer.on_disconnect
    }

    /// Closes the connection and drops queued packets, without raising
    /// `on_disconnect`. Idempotent.
    pub fn close(&self) {
        self.dialer.close();
    }
}

/// A client holding one bonded [`Session`].
///
/// Asks the server for [`LinkConfig::link_count`] links; the server may grant
/// fewer. Queued packets go out on the first link as soon as the session id is
/// known, before the remaining links are opened.
pub struct SessionClient {
    dialer: Arc<Dialer<Session>>,
    factory: RwLock<SessionFactory>,
}

impl SessionClient {
    /// Creates an unconnected client for `endpoint` (`host:port`).
    pub fn new(endpoint: impl Into<String>, registry: Arc<PacketRegistry>, config: LinkConfig) -> Arc<Self> {
        Arc::new(Self {
            dialer: Arc::new(Dialer::new(endpoint.into(), registry, config)),
            factory: RwLock::new(default_session_factory()),
        })
    }

    /// Replaces how the [`Session`] is built on the next connect.
    pub fn set_session_factory(
        &self,
        factory: impl Fn(Uuid, usize, &Arc<PacketRegistry>, &LinkConfig) -> Arc<Session> + Send + Sync + 'static,
    ) {
        *self.factory.write() = Arc::new(factory);
    }

    /// Negotiates a session and opens its links, blocking until every link
    /// was attempted. Follow-up links that fail are logged and skipped.
    pub fn connect(&self) -> Result<Arc<Session>> {
        let factory = self.factory.read().clone();
        self.dialer.connect(|dialer| {
            let config = &dialer.config;
            let desired = u32::try_from(config.link_count).unwrap_or(u32::MAX);
            let stream = transport::connect(&dialer.endpoint, config.connect_timeout)?;
            let mut pending = PendingBond::new(stream);
            pending.send(&Control::new_session(desired))?;
            let (granted, id) = match pending.receive(config.handshake_timeout)? {
                Control::Bond { link_count, session_id } if link_count > 0 => (link_count, session_id),
                other => return Err(NetError::Handshake(format!("unexpected reply {other:?}"))),
            };
            log::debug!("session {id} granted {granted} of {desired} links");

            let session = factory(id, granted as usize, &dialer.registry, config);
            let (stream, seed) = pending.into_parts();
            session.attach(stream, seed)?;
            dialer.establish(&session);

            for n in 1..granted {
                if let Err(e) = Self::attach_link(dialer, &session) {
                    log::warn!("session {id} link {} of {granted} failed: {}", n + 1, e.root_cause());
                }
            }
            Ok(session)
        })
    }

    fn attach_link(dialer: &Dialer<Session>, session: &Arc<Session>) -> Result<()> {
        let stream = transport::connect(&dialer.endpoint, dialer.config.connect_timeout)?;
        let mut pending = PendingBond::new(stream);
        pending.send(&Control::attach(session.id()))?;
        let (stream, seed) = pending.into_parts();
        session.attach(stream, seed)
    }

    /// Sends `packet`, or queues it until the session is negotiated.
    pub fn send_packet<P: Packet>(&self, packet: P) -> bool {
        self.dialer.send(packet)
    }

    /// The current session, if negotiated.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.dialer.current()
    }

    /// Negotiated and still available.
    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|s| s.is_available())
    }

    /// Packets waiting for the session.
    pub fn pending_packets(&self) -> usize {
        self.dialer.pending()
    }

    /// The address every link dials.
    pub fn endpoint(&self) -> &str {
        &self.dialer.endpoint
    }

    /// Raised after a session was negotiated and all its links attempted.
    pub fn on_connected(&self) -> &EventSlot<Session> {
        &self.dialer.on_connected
    }

    /// Raised with the error when negotiating the first link fails.
    pub fn on_connect_failed(&self) -> &EventSlot<NetError> {
        &self.dialer.on_connect_failed
    }

    /// Raised once when the session becomes unavailable, before it is closed.
    pub fn on_disconnect(&self) -> &EventSlot<Session> {
        &self.dialer.on_disconnect
    }

    /// Closes the session and drops queued packets. Idempotent.
    pub fn close(&self) {
        self.dialer.close();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.dialer.close();
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.dialer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::{PacketReader, PacketWriter};
    use crate::packet::tests::Text;
    use crate::peer::PeerHooks;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak, mpsc};
    use std::time::Duration;

    fn registry() -> Arc<PacketRegistry> {
        let registry = PacketRegistry::new();
        registry.register::<Text>().unwrap();
        Arc::new(registry)
    }

    #[test]
    fn sends_before_connect_are_queued() {
        let client = Client::new("127.0.0.1:1", registry(), LinkConfig::default());
        assert!(client.send_packet(Text::new("a")));
        assert!(client.send_packet(Text::new("b")));
        assert_eq!(client.pending_packets(), 2);
        assert!(!client.is_connected());
    }

    #[test]
    fn failed_connect_raises_event_and_keeps_queue() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let client = Client::new(addr.to_string(), registry(), LinkConfig::default());
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        client.on_connect_failed().set(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        client.send_packet(Text::new("queued"));

        assert!(client.connect().is_err());
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_packets(), 1);
    }

    #[test]
    fn closed_client_refuses_work() {
        let client = SessionClient::new("127.0.0.1:1", registry(), LinkConfig::default());
        client.send_packet(Text::new("dropped"));
        client.close();
        client.close();
        assert_eq!(client.pending_packets(), 0);
        assert!(!client.send_packet(Text::new("late")));
        assert!(matches!(client.connect(), Err(NetError::Closed)));
    }

    #[test]
    fn plain_client_announces_itself() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = Client::new(
            server.local_addr().unwrap().to_string(),
            registry(),
            LinkConfig::default().with_connect_timeout(Duration::from_secs(2)),
        );
        client.send_packet(Text::new("first"));
        let connection = client.connect().unwrap();
        assert!(Arc::ptr_eq(&connection, &client.connection().unwrap()));

        let (socket, _) = server.accept().unwrap();
        let mut pending = PendingBond::new(socket);
        assert_eq!(pending.receive(Duration::from_secs(5)).unwrap(), Control::Plain);
        assert_eq!(client.pending_packets(), 0);
        client.close();
    }

    /// Fails to encode, which faults the connection it is sent on.
    #[derive(Debug, Default)]
    struct Unencodable;

    impl Packet for Unencodable {
        fn key(&self) -> u32 {
            9
        }

        fn write(&self, _: &mut PacketWriter) -> Result<()> {
            Err(NetError::malformed("cannot encode"))
        }

        fn read(&mut self, _: &mut PacketReader) -> Result<()> {
            Ok(())
        }
    }

    /// Sends through the owning client from inside the fault hook.
    #[derive(Default)]
    struct ResendOnFault {
        client: OnceLock<Weak<Client>>,
        faults: AtomicUsize,
    }

    impl PeerHooks<Connection> for ResendOnFault {
        fn on_transport_fault(&self, _: &Connection, _: &NetError) {
            self.faults.fetch_add(1, Ordering::SeqCst);
            if let Some(client) = self.client.get().and_then(Weak::upgrade) {
                client.send_packet(Text::new("from hook"));
            }
        }
    }

    #[test]
    fn fault_hook_may_send_while_queue_drains() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let hooks = Arc::new(ResendOnFault::default());
        let client = Client::new(server.local_addr().unwrap().to_string(), registry(), LinkConfig::default());
        hooks.client.set(Arc::downgrade(&client)).unwrap();
        let installed = hooks.clone();
        client.set_connection_factory(move |stream, registry, config| {
            Connection::with_hooks(stream, registry.clone(), config, installed.clone())
        });

        client.send_packet(Unencodable);
        client.send_packet(Text::new("after"));

        let (done, finished) = mpsc::channel();
        let connecting = client.clone();
        std::thread::spawn(move || {
            let _ = done.send(connecting.connect().is_ok());
        });
        assert_eq!(finished.recv_timeout(Duration::from_secs(5)), Ok(true));
        assert_eq!(hooks.faults.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_packets(), 0);
        client.close();
    }
}
