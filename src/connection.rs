//! Single-link connection: one socket, one receive pump, one handler slot.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::codec::WireCodec;
use crate::config::LinkConfig;
use crate::error::{NetError, Result};
use crate::frame_buffer::FrameBuffer;
use crate::inbox::Inbox;
use crate::link::{self, Link, LinkSink};
use crate::packet::{Packet, PacketHandler};
use crate::peer::{NoHooks, PeerHooks, PeerState, StateCell};
use crate::registry::PacketRegistry;

/// Builds the [`Connection`] for a socket a manager just promoted.
///
/// Install one to attach [`PeerHooks`] or a packet handler before the
/// connection starts receiving.
pub type ConnectionFactory =
    Arc<dyn Fn(TcpStream, &Arc<PacketRegistry>, &LinkConfig) -> Result<Arc<Connection>> + Send + Sync>;

/// The factory managers use unless told otherwise.
pub fn default_connection_factory() -> ConnectionFactory {
    Arc::new(|stream: TcpStream, registry: &Arc<PacketRegistry>, config: &LinkConfig| {
        Connection::new(stream, registry.clone(), config)
    })
}

/// A typed-packet connection over exactly one stream socket.
///
/// Created by a [`Listener`](crate::Listener) or a [`Client`](crate::Client)
/// (or directly around an already connected socket). Packets received before
/// a handler is attached are queued and flushed, in order, to the first
/// handler set with [`set_packet_handler`](Self::set_packet_handler).
///
/// Failures are never returned to the sender: a broken socket calls
/// [`PeerHooks::on_transport_fault`] once and moves the connection to
/// [`PeerState::Closing`], where the owning manager's sweep reports it and
/// releases the socket.
pub struct Connection {
    link: Arc<Link>,
    /// Read half, taken by the pump when receiving starts.
    reader: Mutex<Option<TcpStream>>,
    state: StateCell,
    last_activity: Mutex<Instant>,
    keep_alive: Duration,
    receive_buffer_size: usize,
    registry: Arc<PacketRegistry>,
    codec: WireCodec,
    inbox: Inbox<Connection>,
    hooks: Arc<dyn PeerHooks<Connection>>,
}

impl Connection {
    /// Wraps a connected socket with no hooks. Call
    /// [`begin_receive`](Self::begin_receive) to start reading.
    pub fn new(stream: TcpStream, registry: Arc<PacketRegistry>, config: &LinkConfig) -> Result<Arc<Self>> {
        Self::with_hooks(stream, registry, config, Arc::new(NoHooks))
    }

    /// Like [`new`](Self::new), with `hooks` installed.
    pub fn with_hooks(
        stream: TcpStream,
        registry: Arc<PacketRegistry>,
        config: &LinkConfig,
        hooks: Arc<dyn PeerHooks<Connection>>,
    ) -> Result<Arc<Self>> {
        stream.set_nodelay(config.nodelay)?;
        let (link, reader) = Link::open(stream)?;
        log::debug!("connection on link {} to {:?}", link.id(), link.peer_addr());
        Ok(Arc::new(Self {
            link,
            reader: Mutex::new(Some(reader)),
            state: StateCell::new(),
            last_activity: Mutex::new(Instant::now()),
            keep_alive: config.keep_alive,
            receive_buffer_size: config.receive_buffer_size,
            registry,
            codec: config.codec(),
            inbox: Inbox::new(),
            hooks,
        }))
    }

    /// Starts the receive pump. `seed` holds bytes already read from the
    /// socket (e.g. past the handshake). Calling it again does nothing.
    pub fn begin_receive(self: &Arc<Self>, seed: Vec<u8>) -> Result<()> {
        let Some(reader) = self.reader.lock().take() else {
            return Ok(());
        };
        link::spawn_reader(self.link.clone(), reader, seed, self.receive_buffer_size, self.clone())?;
        Ok(())
    }

    /// Encodes and writes `packet`.
    ///
    /// Returns `false` without doing anything when the connection is no longer
    /// open, and `false` after routing the error to the fault path when the
    /// write fails.
    pub fn send_packet(&self, packet: &dyn Packet) -> bool {
        if !self.is_available() || !self.link.is_connected() {
            return false;
        }
        let sent = self
            .codec
            .outbound(packet)
            .and_then(|bytes| self.link.send(&bytes).map_err(NetError::from));
        match sent {
            Ok(()) => {
                self.touch();
                true
            }
            Err(e) => {
                self.fault(e);
                false
            }
        }
    }

    /// Keep-alive check, driven by the owning manager's sweep.
    ///
    /// With a keep-alive timeout configured this calls
    /// [`PeerHooks::on_idle`] and then disconnects if nothing was sent or
    /// received for longer than the timeout.
    pub fn update(&self, now: Instant) {
        if self.keep_alive.is_zero() || !self.is_available() {
            return;
        }
        self.hooks.on_idle(self, self.idle_at(now));
        let idle = self.idle_at(now);
        if idle > self.keep_alive {
            log::debug!("link {} idle for {idle:?}, disconnecting", self.link.id());
            self.disconnect();
        }
    }

    /// Marks the connection unavailable. The socket stays open until
    /// [`close`](Self::close). Idempotent.
    pub fn disconnect(&self) {
        self.state.begin_closing();
    }

    /// Releases the socket. Idempotent.
    pub fn close(&self) {
        if self.state.close() {
            self.link.shutdown();
        }
    }

    /// Attaches `handler`, first flushing every queued packet to it in order.
    pub fn set_packet_handler(&self, handler: impl PacketHandler<Connection> + 'static) {
        self.inbox.set_handler(self, Some(Arc::new(handler)));
    }

    /// Detaches the handler; packets queue again until the next one is set.
    pub fn clear_packet_handler(&self) {
        self.inbox.set_handler(self, None);
    }

    /// A handler is attached.
    pub fn has_packet_handler(&self) -> bool {
        self.inbox.has_handler()
    }

    /// Pops the oldest packet queued while no handler was attached.
    pub fn poll_packet(&self) -> Option<Box<dyn Packet>> {
        self.inbox.poll()
    }

    /// Packets received while no handler was attached.
    pub fn pending_packets(&self) -> usize {
        self.inbox.pending()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        self.state.get()
    }

    /// Still [`PeerState::Open`].
    pub fn is_available(&self) -> bool {
        self.state.get() == PeerState::Open
    }

    /// Whether the socket is still believed to be up.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Last successful send or receive.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Idle timeout; zero when disabled.
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Remote address, if the socket still knows it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.peer_addr()
    }

    /// Process-unique id of the underlying link.
    pub fn link_id(&self) -> u64 {
        self.link.id()
    }

    /// Packet types this connection can decode.
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    /// The send/receive pipeline.
    pub fn codec(&self) -> &WireCodec {
        &self.codec
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    fn fault(&self, cause: NetError) {
        if !self.is_available() {
            log::debug!("link {} fault after close ignored: {}", self.link.id(), cause.root_cause());
            return;
        }
        log::debug!("link {} transport fault: {}", self.link.id(), cause.root_cause());
        self.hooks.on_transport_fault(self, &cause);
        self.disconnect();
    }
}

impl LinkSink for Connection {
    fn on_chunk(&self, _link: &Arc<Link>, frames: &mut FrameBuffer, chunk: &[u8]) -> Result<()> {
        self.touch();
        self.codec
            .ingest(frames, chunk, &self.registry, |packet| self.inbox.deliver(self, packet))
    }

    fn on_link_down(&self, link: &Arc<Link>, cause: Option<NetError>) {
        let was_up = link.mark_down();
        match cause {
            None => {
                if self.state.begin_closing() {
                    log::debug!("link {} closed by peer", link.id());
                }
            }
            Some(cause) if was_up => self.fault(cause),
            Some(cause) => log::trace!("link {} read ended after shutdown: {cause}", link.id()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("link", &self.link)
            .field("state", &self.state.get())
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}
