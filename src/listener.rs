//! Accepting side: turns incoming sockets into connections and sessions.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use polling::{Event, Events, Poller};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::connection::{Connection, ConnectionFactory, default_connection_factory};
use crate::error::{NetError, Result};
use crate::events::EventSlot;
use crate::handshake::{Control, PendingBond};
use crate::packet::Packet;
use crate::peer::PeerState;
use crate::registry::PacketRegistry;
use crate::session::{Session, SessionFactory, default_session_factory};

const ACCEPT_KEY: usize = 0;

/// A peer tracked by a [`Listener`].
#[derive(Debug, Clone)]
pub enum Peer {
    /// A plain single-socket connection.
    Single(Arc<Connection>),
    /// A bonded session.
    Bonded(Arc<Session>),
}

impl Peer {
    /// Sends through whichever peer this is.
    pub fn send_packet(&self, packet: &dyn Packet) -> bool {
        match self {
            Peer::Single(c) => c.send_packet(packet),
            Peer::Bonded(s) => s.send_packet(packet),
        }
    }

    /// Lifecycle state of the underlying peer.
    pub fn state(&self) -> PeerState {
        match self {
            Peer::Single(c) => c.state(),
            Peer::Bonded(s) => s.state(),
        }
    }

    /// Still open.
    pub fn is_available(&self) -> bool {
        self.state() == PeerState::Open
    }

    /// Runs the keep-alive check.
    pub fn update(&self, now: Instant) {
        match self {
            Peer::Single(c) => c.update(now),
            Peer::Bonded(s) => s.update(now),
        }
    }

    /// Marks the peer unavailable; the next sweep reports and closes it.
    pub fn disconnect(&self) {
        match self {
            Peer::Single(c) => c.disconnect(),
            Peer::Bonded(s) => s.disconnect(),
        }
    }

    /// Releases the peer's sockets now.
    pub fn close(&self) {
        match self {
            Peer::Single(c) => c.close(),
            Peer::Bonded(s) => s.close(),
        }
    }

    /// The connection, for a plain peer.
    pub fn as_connection(&self) -> Option<&Arc<Connection>> {
        match self {
            Peer::Single(c) => Some(c),
            Peer::Bonded(_) => None,
        }
    }

    /// The session, for a bonded peer.
    pub fn as_session(&self) -> Option<&Arc<Session>> {
        match self {
            Peer::Bonded(s) => Some(s),
            Peer::Single(_) => None,
        }
    }

    /// Whether both refer to the same connection or session.
    pub fn same_as(&self, other: &Peer) -> bool {
        match (self, other) {
            (Peer::Single(a), Peer::Single(b)) => Arc::ptr_eq(a, b),
            (Peer::Bonded(a), Peer::Bonded(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Accepts plain and bonded peers on one TCP port.
///
/// Each accepted socket negotiates on its own thread, so a slow or broken
/// handshake never holds up the accept loop or other peers. A sweep thread
/// reports peers that became unavailable through
/// [`on_disconnect`](Self::on_disconnect), exactly once each, and drives
/// keep-alive on the rest.
///
/// # Example
///
/// ```no_run
/// use bond_net::{LinkConfig, Listener, PacketRegistry};
/// use std::sync::Arc;
///
/// let listener = Listener::bind("0.0.0.0:9000", Arc::new(PacketRegistry::new()), LinkConfig::default())?;
/// listener.on_accept.set(|peer| println!("accepted {peer:?}"));
/// listener.listen()?;
/// # Ok::<(), bond_net::NetError>(())
/// ```
pub struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    poller: Poller,
    registry: Arc<PacketRegistry>,
    config: LinkConfig,
    peers: Mutex<Vec<Peer>>,
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    connection_factory: RwLock<ConnectionFactory>,
    session_factory: RwLock<SessionFactory>,
    listening: AtomicBool,
    closed: AtomicBool,
    wake: Mutex<()>,
    wake_cv: Condvar,
    /// Raised once a peer finished its handshake and is usable.
    pub on_accept: EventSlot<Peer>,
    /// Raised once per peer when the sweep finds it unavailable, before it is closed.
    pub on_disconnect: EventSlot<Peer>,
}

impl Listener {
    /// Binds the listening socket. Nothing is accepted until [`listen`](Self::listen).
    pub fn bind(addr: impl ToSocketAddrs, registry: Arc<PacketRegistry>, config: LinkConfig) -> Result<Arc<Self>> {
        let socket = TcpListener::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let poller = Poller::new()?;
        // SAFETY: `socket` is owned by the listener alongside `poller` and is
        // removed from it in `Drop` before being closed.
        unsafe { poller.add(&socket, Event::readable(ACCEPT_KEY))? };
        log::debug!("listener bound to {local_addr}");

        Ok(Arc::new(Self {
            socket,
            local_addr,
            poller,
            registry,
            config,
            peers: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            connection_factory: RwLock::new(default_connection_factory()),
            session_factory: RwLock::new(default_session_factory()),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
            on_accept: EventSlot::new(),
            on_disconnect: EventSlot::new(),
        }))
    }

    /// Starts the accept and sweep threads. Calling it twice is a no-op.
    pub fn listen(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        if self.listening.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let this = self.clone();
        thread::Builder::new()
            .name("bond-accept".into())
            .spawn(move || this.accept_loop())?;
        let this = self.clone();
        thread::Builder::new()
            .name("bond-sweep".into())
            .spawn(move || this.sweep_loop())?;
        log::info!("listening on {}", self.local_addr);
        Ok(())
    }

    /// Replaces how plain connections are built from now on.
    pub fn set_connection_factory(
        &self,
        factory: impl Fn(TcpStream, &Arc<PacketRegistry>, &LinkConfig) -> Result<Arc<Connection>> + Send + Sync + 'static,
    ) {
        *self.connection_factory.write() = Arc::new(factory);
    }

    /// Replaces how sessions are built for new bond requests.
    pub fn set_session_factory(
        &self,
        factory: impl Fn(Uuid, usize, &Arc<PacketRegistry>, &LinkConfig) -> Arc<Session> + Send + Sync + 'static,
    ) {
        *self.session_factory.write() = Arc::new(factory);
    }

    /// The bound address, with the real port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Packet types every accepted peer decodes.
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    /// Settings handed to every accepted peer.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Snapshot of the tracked peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.lock().clone()
    }

    /// The live session with `id`, if any.
    pub fn session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends `packet` to every available peer but `except`. Returns how many
    /// sends succeeded.
    pub fn broadcast(&self, packet: &dyn Packet, except: Option<&Peer>) -> usize {
        self.peers()
            .iter()
            .filter(|peer| !except.is_some_and(|e| e.same_as(peer)))
            .filter(|peer| peer.is_available())
            .filter(|peer| peer.send_packet(packet))
            .count()
    }

    /// Runs keep-alive on every peer, then reports and releases the ones
    /// found unavailable. A peer timed out here is reported by this same call.
    pub fn sweep(&self, now: Instant) {
        for peer in self.peers() {
            peer.update(now);
        }
        let gone: Vec<Peer> = {
            let mut peers = self.peers.lock();
            let (gone, live): (Vec<Peer>, Vec<Peer>) =
                std::mem::take(&mut *peers).into_iter().partition(|p| !p.is_available());
            *peers = live;
            gone
        };
        for peer in gone {
            if let Peer::Bonded(session) = &peer {
                self.sessions.lock().remove(&session.id());
            }
            log::debug!("peer disconnected: {peer:?}");
            self.on_disconnect.emit(&peer);
            peer.close();
        }
    }

    /// Stops accepting and closes every peer without raising
    /// [`on_disconnect`](Self::on_disconnect). Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.poller.notify() {
            log::warn!("could not wake accept loop: {e}");
        }
        {
            let _guard = self.wake.lock();
            self.wake_cv.notify_all();
        }
        let peers = std::mem::take(&mut *self.peers.lock());
        self.sessions.lock().clear();
        for peer in peers {
            peer.close();
        }
        log::info!("listener on {} closed", self.local_addr);
    }

    fn accept_loop(self: Arc<Self>) {
        let mut events = Events::new();
        while !self.is_closed() {
            events.clear();
            match self.poller.wait(&mut events, None) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept loop on {} stopped: {e}", self.local_addr);
                    return;
                }
            }
            if self.is_closed() {
                break;
            }
            if events.iter().any(|ev| ev.key == ACCEPT_KEY) {
                self.drain_accepts();
            }
            if let Err(e) = self.poller.modify(&self.socket, Event::readable(ACCEPT_KEY)) {
                log::warn!("accept loop on {} could not re-arm: {e}", self.local_addr);
                return;
            }
        }
        log::debug!("accept loop on {} finished", self.local_addr);
    }

    fn drain_accepts(self: &Arc<Self>) {
        loop {
            match self.socket.accept() {
                Ok((stream, addr)) => {
                    log::debug!("accepted socket from {addr}");
                    if let Err(e) = stream.set_nonblocking(false) {
                        log::warn!("dropping socket from {addr}: {e}");
                        continue;
                    }
                    let this = self.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("bond-handshake-{addr}"))
                        .spawn(move || this.negotiate(stream, addr));
                    if let Err(e) = spawned {
                        log::warn!("could not start handshake for {addr}: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept on {} failed: {e}", self.local_addr);
                    return;
                }
            }
        }
    }

    fn negotiate(&self, stream: TcpStream, addr: SocketAddr) {
        match self.promote(stream) {
            Ok(()) => {}
            Err(e @ NetError::BondingMismatch(_)) => log::warn!("dropping socket from {addr}: {e}"),
            Err(e) => log::debug!("handshake with {addr} failed: {}", e.root_cause()),
        }
    }

    fn promote(&self, stream: TcpStream) -> Result<()> {
        let mut pending = PendingBond::new(stream);
        match pending.receive(self.config.handshake_timeout)? {
            Control::Plain => {
                let (stream, seed) = pending.into_parts();
                let factory = self.connection_factory.read().clone();
                let connection = factory(stream, &self.registry, &self.config)?;
                connection.begin_receive(seed)?;
                self.admit(Peer::Single(connection));
            }
            Control::Bond { link_count: 0, session_id } => {
                let session = self
                    .session(session_id)
                    .filter(|s| s.is_available())
                    .ok_or(NetError::BondingMismatch(session_id))?;
                let (stream, seed) = pending.into_parts();
                session.attach(stream, seed)?;
            }
            Control::Bond { link_count, .. } => {
                let limit = u32::try_from(self.config.link_count).unwrap_or(u32::MAX).max(1);
                let granted = link_count.min(limit);
                let id = Uuid::new_v4();
                let factory = self.session_factory.read().clone();
                let session = factory(id, granted as usize, &self.registry, &self.config);
                self.sessions.lock().insert(id, session.clone());

                let first = match pending.send(&Control::Bond { link_count: granted, session_id: id }) {
                    Ok(()) => {
                        let (stream, seed) = pending.into_parts();
                        session.attach(stream, seed)
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = first {
                    self.sessions.lock().remove(&id);
                    session.close();
                    return Err(e);
                }
                log::debug!("session {id} opened with {granted} of {link_count} requested links");
                self.admit(Peer::Bonded(session));
            }
        }
        Ok(())
    }

    fn admit(&self, peer: Peer) {
        if self.is_closed() {
            peer.close();
            return;
        }
        self.peers.lock().push(peer.clone());
        {
            // The sweep may be parked on the idle interval.
            let _guard = self.wake.lock();
            self.wake_cv.notify_all();
        }
        self.on_accept.emit(&peer);
    }

    fn sweep_loop(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                break;
            }
            self.sweep(Instant::now());
            let mut guard = self.wake.lock();
            if self.is_closed() {
                break;
            }
            let interval = if self.peers.lock().is_empty() {
                self.config.idle_sweep_interval
            } else {
                self.config.sweep_interval
            };
            self.wake_cv.wait_for(&mut guard, interval);
        }
        log::debug!("sweep on {} finished", self.local_addr);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(e) = self.poller.delete(&self.socket) {
            log::trace!("removing listener from poller: {e}");
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
