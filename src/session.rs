//! Bonded session: one logical connection striped over several links.
//!
//! Outbound packets go round-robin over the live links; every link runs its
//! own receive pump with its own frame buffer, and all of them feed the
//! session's single handler slot. Packets sent on different links may arrive
//! in any relative order.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::codec::WireCodec;
use crate::config::LinkConfig;
use crate::error::{NetError, Result};
use crate::frame_buffer::FrameBuffer;
use crate::inbox::Inbox;
use crate::link::{self, Link, LinkSink};
use crate::packet::{Packet, PacketHandler};
use crate::peer::{NoHooks, PeerHooks, PeerState, StateCell};
use crate::registry::PacketRegistry;

/// Builds the [`Session`] for a freshly negotiated bond: session id and
/// granted link count.
pub type SessionFactory = Arc<dyn Fn(Uuid, usize, &Arc<PacketRegistry>, &LinkConfig) -> Arc<Session> + Send + Sync>;

/// The factory managers use unless told otherwise.
pub fn default_session_factory() -> SessionFactory {
    Arc::new(|id: Uuid, links: usize, registry: &Arc<PacketRegistry>, config: &LinkConfig| {
        Session::new(id, links, registry.clone(), config)
    })
}

#[derive(Default)]
struct LinkSet {
    links: Vec<Arc<Link>>,
    cursor: usize,
}

/// A logical connection backed by an ordered set of links.
///
/// The session stays available while at least one link is alive; losing a
/// link only removes that link. Its id is minted by the accepting side when
/// the first link arrives and never changes.
pub struct Session {
    id: Uuid,
    links: Mutex<LinkSet>,
    expected_links: usize,
    /// Links ever attached, capped at `expected_links`.
    attached: AtomicUsize,
    state: StateCell,
    last_activity: Mutex<Instant>,
    keep_alive: Duration,
    receive_buffer_size: usize,
    nodelay: bool,
    registry: Arc<PacketRegistry>,
    codec: WireCodec,
    inbox: Inbox<Session>,
    hooks: Arc<dyn PeerHooks<Session>>,
}

impl Session {
    /// A session with no links yet and no hooks.
    pub fn new(id: Uuid, expected_links: usize, registry: Arc<PacketRegistry>, config: &LinkConfig) -> Arc<Self> {
        Self::with_hooks(id, expected_links, registry, config, Arc::new(NoHooks))
    }

    /// Like [`new`](Self::new), with `hooks` installed.
    pub fn with_hooks(
        id: Uuid,
        expected_links: usize,
        registry: Arc<PacketRegistry>,
        config: &LinkConfig,
        hooks: Arc<dyn PeerHooks<Session>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            links: Mutex::new(LinkSet::default()),
            expected_links: expected_links.max(1),
            attached: AtomicUsize::new(0),
            state: StateCell::new(),
            last_activity: Mutex::new(Instant::now()),
            keep_alive: config.keep_alive,
            receive_buffer_size: config.receive_buffer_size,
            nodelay: config.nodelay,
            registry,
            codec: config.codec(),
            inbox: Inbox::new(),
            hooks,
        })
    }

    /// Folds a connected socket into the session and starts its pump.
    ///
    /// `seed` holds bytes read past the handshake on that socket. Fails with
    /// [`NetError::BondingMismatch`] once the session already took its
    /// expected number of links, and with [`NetError::Closed`] after it was
    /// disconnected.
    pub fn attach(self: &Arc<Self>, stream: TcpStream, seed: Vec<u8>) -> Result<()> {
        if !self.is_available() {
            return Err(NetError::Closed);
        }
        self.attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.expected_links).then_some(n + 1))
            .map_err(|_| NetError::BondingMismatch(self.id))?;

        stream.set_nodelay(self.nodelay)?;
        let (link, reader) = Link::open(stream)?;
        {
            let mut set = self.links.lock();
            if !self.is_available() {
                drop(set);
                link.shutdown();
                return Err(NetError::Closed);
            }
            set.links.push(link.clone());
        }
        if let Err(e) = link::spawn_reader(link.clone(), reader, seed, self.receive_buffer_size, self.clone()) {
            self.evict(&link);
            return Err(e.into());
        }
        self.touch();
        log::debug!(
            "session {} attached link {} ({}/{})",
            self.id,
            link.id(),
            self.attached.load(Ordering::Acquire),
            self.expected_links
        );
        Ok(())
    }

    /// Picks the next link round-robin, evicting any found disconnected.
    ///
    /// Only the selection runs under the lock; the caller writes outside it.
    fn next_link(&self) -> Option<Arc<Link>> {
        let mut set = self.links.lock();
        loop {
            if set.links.is_empty() {
                return None;
            }
            let index = set.cursor % set.links.len();
            if set.links[index].is_connected() {
                set.cursor = index + 1;
                return Some(set.links[index].clone());
            }
            let dead = set.links.remove(index);
            log::debug!("session {} evicted dead link {}", self.id, dead.id());
            set.cursor = index;
        }
    }

    /// Encodes `packet` and writes it to the next link in turn.
    ///
    /// Returns `false` when the session is unavailable, has no live link, or
    /// the write failed. A failed write drops that link only.
    pub fn send_packet(&self, packet: &dyn Packet) -> bool {
        if !self.is_available() {
            return false;
        }
        let Some(link) = self.next_link() else {
            log::debug!("session {} has no links left", self.id);
            self.disconnect();
            return false;
        };
        let bytes = match self.codec.outbound(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!("session {} could not encode packet {}: {e}", self.id, packet.key());
                self.hooks.on_transport_fault(self, &e);
                return false;
            }
        };
        match link.send(&bytes) {
            Ok(()) => {
                self.touch();
                true
            }
            Err(e) => {
                let was_up = link.mark_down();
                self.link_failed(&link, was_up.then(|| e.into()));
                false
            }
        }
    }

    /// Keep-alive check, driven by the owning manager's sweep.
    pub fn update(&self, now: Instant) {
        if self.keep_alive.is_zero() || !self.is_available() {
            return;
        }
        self.hooks.on_idle(self, self.idle_at(now));
        let idle = self.idle_at(now);
        if idle > self.keep_alive {
            log::debug!("session {} idle for {idle:?}, disconnecting", self.id);
            self.disconnect();
        }
    }

    /// Marks the session unavailable; links stay open until [`close`](Self::close).
    pub fn disconnect(&self) {
        self.state.begin_closing();
    }

    /// Shuts every link down. Idempotent.
    ///
    /// The state flips under the link lock, so an `attach` racing this either
    /// lands before and is shut down here, or sees the session closed.
    pub fn close(&self) {
        let links = {
            let mut set = self.links.lock();
            if !self.state.close() {
                return;
            }
            std::mem::take(&mut set.links)
        };
        for link in links {
            link.shutdown();
        }
    }

    /// Attaches `handler`, first flushing queued packets to it in arrival order.
    pub fn set_packet_handler(&self, handler: impl PacketHandler<Session> + 'static) {
        self.inbox.set_handler(self, Some(Arc::new(handler)));
    }

    /// Detaches the handler; packets queue again.
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

    /// Packets waiting for a handler.
    pub fn pending_packets(&self) -> usize {
        self.inbox.pending()
    }

    /// Id minted by the accepting side.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        self.state.get()
    }

    /// Still [`PeerState::Open`].
    pub fn is_available(&self) -> bool {
        self.state.get() == PeerState::Open
    }

    /// `true` while any link is up.
    pub fn is_connected(&self) -> bool {
        self.links.lock().links.iter().any(|l| l.is_connected())
    }

    /// Links currently in the set.
    pub fn link_count(&self) -> usize {
        self.links.lock().links.len()
    }

    /// Links negotiated in the handshake.
    pub fn expected_links(&self) -> usize {
        self.expected_links
    }

    /// Links attached so far, including ones since lost.
    pub fn attached_links(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Every negotiated link has been attached.
    pub fn is_fully_bonded(&self) -> bool {
        self.attached_links() == self.expected_links
    }

    /// Ids of the links in send order.
    pub fn link_ids(&self) -> Vec<u64> {
        self.links.lock().links.iter().map(|l| l.id()).collect()
    }

    /// Last send or receive on any link.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Packet types this session can decode.
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    fn evict(&self, link: &Arc<Link>) -> usize {
        let mut set = self.links.lock();
        if let Some(index) = set.links.iter().position(|l| Arc::ptr_eq(l, link)) {
            set.links.remove(index);
            if set.cursor > index {
                set.cursor -= 1;
            }
        }
        set.links.len()
    }

    /// Drops a failed link; the session only goes down with its last link.
    fn link_failed(&self, link: &Arc<Link>, cause: Option<NetError>) {
        if let Some(cause) = &cause {
            if self.is_available() {
                log::debug!("session {} link {} fault: {}", self.id, link.id(), cause.root_cause());
                self.hooks.on_transport_fault(self, cause);
            }
        }
        link.shutdown();
        let left = self.evict(link);
        if left == 0 && self.state.begin_closing() {
            log::debug!("session {} lost its last link", self.id);
        }
    }
}

impl LinkSink for Session {
    fn on_chunk(&self, _link: &Arc<Link>, frames: &mut FrameBuffer, chunk: &[u8]) -> Result<()> {
        self.touch();
        self.codec
            .ingest(frames, chunk, &self.registry, |packet| self.inbox.deliver(self, packet))
    }

    fn on_link_down(&self, link: &Arc<Link>, cause: Option<NetError>) {
        let was_up = link.mark_down();
        if cause.is_none() && was_up {
            log::debug!("session {} link {} closed by peer", self.id, link.id());
        }
        self.link_failed(link, cause.filter(|_| was_up));
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("links", &self.link_ids())
            .field("expected_links", &self.expected_links)
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::socket_pair;
    use crate::packet::tests::{Counter, Text};

    fn registry() -> Arc<PacketRegistry> {
        let registry = PacketRegistry::new();
        registry.register::<Text>().unwrap().register::<Counter>().unwrap();
        Arc::new(registry)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Two sessions joined by `n` socket pairs.
    fn bonded(n: usize) -> (Arc<Session>, Arc<Session>) {
        let id = Uuid::new_v4();
        let config = LinkConfig::default();
        let a = Session::new(id, n, registry(), &config);
        let b = Session::new(id, n, registry(), &config);
        for _ in 0..n {
            let (x, y) = socket_pair();
            a.attach(x, Vec::new()).unwrap();
            b.attach(y, Vec::new()).unwrap();
        }
        (a, b)
    }

    #[derive(Default)]
    struct FaultCount(AtomicUsize);

    impl PeerHooks<Session> for FaultCount {
        fn on_transport_fault(&self, _: &Session, _: &NetError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn round_robin_covers_every_link_each_cycle() {
        let (a, _b) = bonded(3);
        let order: Vec<u64> = (0..6).map(|_| a.next_link().unwrap().id()).collect();
        let ids = a.link_ids();
        assert_eq!(&order[..3], &ids[..]);
        assert_eq!(&order[3..], &ids[..]);
    }

    #[test]
    fn fan_in_delivers_everything() {
        let (a, b) = bonded(3);
        for value in 0..30 {
            assert!(a.send_packet(&Counter { value }));
        }
        assert!(wait_for(|| b.pending_packets() == 30));
        let mut values: Vec<u64> = std::iter::from_fn(|| b.poll_packet())
            .map(|p| p.downcast_ref::<Counter>().unwrap().value)
            .collect();
        values.sort_unstable();
        assert_eq!(values, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn attach_beyond_expected_is_refused() {
        let (a, _b) = bonded(2);
        let (x, _y) = socket_pair();
        assert!(matches!(a.attach(x, Vec::new()), Err(NetError::BondingMismatch(id)) if id == a.id()));
        assert!(a.is_fully_bonded());
    }

    #[test]
    fn losing_one_link_keeps_the_session() {
        let id = Uuid::new_v4();
        let hooks = Arc::new(FaultCount::default());
        let a = Session::with_hooks(id, 2, registry(), &LinkConfig::default(), hooks.clone());
        let (x1, y1) = socket_pair();
        let (x2, y2) = socket_pair();
        a.attach(x1, Vec::new()).unwrap();
        a.attach(x2, Vec::new()).unwrap();

        drop(y1);
        assert!(wait_for(|| a.link_count() == 1));
        assert!(a.is_available());
        assert_eq!(hooks.0.load(Ordering::SeqCst), 0);
        assert!(a.send_packet(&Text::new("still here")));

        drop(y2);
        assert!(wait_for(|| a.state() == PeerState::Closing));
        assert_eq!(a.link_count(), 0);
        assert!(!a.send_packet(&Text::new("gone")));
    }

    #[test]
    fn next_link_skips_and_evicts_dead_links() {
        let (a, _b) = bonded(3);
        let ids = a.link_ids();
        a.links.lock().links[1].mark_down();

        let picked: Vec<u64> = (0..4).map(|_| a.next_link().unwrap().id()).collect();
        assert_eq!(picked, vec![ids[0], ids[2], ids[0], ids[2]]);
        assert_eq!(a.link_ids(), vec![ids[0], ids[2]]);
    }

    #[test]
    fn close_releases_all_links() {
        let (a, b) = bonded(2);
        a.close();
        a.close();
        assert_eq!(a.state(), PeerState::Closed);
        assert_eq!(a.link_count(), 0);
        assert!(wait_for(|| b.state() == PeerState::Closing));
        assert!(matches!(a.attach(socket_pair().0, Vec::new()), Err(NetError::Closed)));
    }

    #[test]
    fn attach_racing_close_never_leaves_a_live_link() {
        let config = LinkConfig::default();
        for _ in 0..300 {
            let session = Session::new(Uuid::new_v4(), 4, registry(), &config);
            let (x, _y) = socket_pair();
            let attaching = {
                let session = session.clone();
                std::thread::spawn(move || session.attach(x, Vec::new()))
            };
            session.close();
            let attached = attaching.join().unwrap();
            assert!(matches!(attached, Ok(()) | Err(NetError::Closed)));
            assert_eq!(session.state(), PeerState::Closed);
            assert_eq!(session.link_count(), 0);
        }
    }
}
