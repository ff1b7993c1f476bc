//! One physical socket and the thread that pumps bytes out of it.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::error::{NetError, Result};
use crate::frame_buffer::FrameBuffer;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Receives what a link's pump thread reads.
pub(crate) trait LinkSink: Send + Sync + 'static {
    /// One chunk straight off the socket. An error ends the pump.
    fn on_chunk(&self, link: &Arc<Link>, frames: &mut FrameBuffer, chunk: &[u8]) -> Result<()>;

    /// The pump stopped: `None` on orderly EOF, otherwise the fault.
    fn on_link_down(&self, link: &Arc<Link>, cause: Option<NetError>);
}

/// A connected stream socket.
///
/// Writes are serialized by a per-link mutex so concurrent senders never
/// interleave frames; reads happen on a cloned handle owned by the pump.
pub struct Link {
    id: u64,
    peer_addr: Option<SocketAddr>,
    writer: Mutex<TcpStream>,
    /// Second handle so shutdown never waits behind a blocked writer.
    control: TcpStream,
    connected: AtomicBool,
}

impl Link {
    /// Wraps `stream`, returning the link and the handle its pump reads from.
    pub(crate) fn open(stream: TcpStream) -> io::Result<(Arc<Link>, TcpStream)> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let link = Link {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr: stream.peer_addr().ok(),
            writer: Mutex::new(stream),
            control,
            connected: AtomicBool::new(true),
        };
        Ok((Arc::new(link), reader))
    }

    /// Process-unique id, used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Writes `bytes` in full.
    pub(crate) fn send(&self, bytes: &[u8]) -> io::Result<()> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link is down"));
        }
        let mut writer = self.writer.lock();
        writer.write_all(bytes)?;
        writer.flush()
    }

    /// Flags the link as down. Returns `true` for the call that flipped it.
    pub(crate) fn mark_down(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    /// Marks the link down and shuts the socket, waking its pump. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.mark_down();
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            log::trace!("link {} shutdown: {e}", self.id);
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Starts the receive pump for `link`.
///
/// `seed` holds bytes that were read past a handshake message; they are fed to
/// the sink before the first socket read.
pub(crate) fn spawn_reader<S: LinkSink>(
    link: Arc<Link>,
    reader: TcpStream,
    seed: Vec<u8>,
    buffer_size: usize,
    sink: Arc<S>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("bond-rx-{}", link.id))
        .spawn(move || pump(link, reader, seed, buffer_size, sink))?;
    Ok(())
}

fn pump<S: LinkSink>(link: Arc<Link>, mut reader: TcpStream, seed: Vec<u8>, buffer_size: usize, sink: Arc<S>) {
    let mut frames = FrameBuffer::with_capacity(buffer_size);
    if !seed.is_empty() {
        if let Err(e) = sink.on_chunk(&link, &mut frames, &seed) {
            sink.on_link_down(&link, Some(e));
            return;
        }
    }
    let mut chunk = vec![0u8; buffer_size];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => {
                log::debug!("link {} reached end of stream", link.id);
                sink.on_link_down(&link, None);
                return;
            }
            Ok(n) => {
                if let Err(e) = sink.on_chunk(&link, &mut frames, &chunk[..n]) {
                    sink.on_link_down(&link, Some(e));
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                sink.on_link_down(&link, Some(e.into()));
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    /// A connected loopback socket pair: (dialer, acceptor).
    pub(crate) fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let dialer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (acceptor, _) = listener.accept().unwrap();
        (dialer, acceptor)
    }

    struct Collect(Mutex<mpsc::Sender<Option<Vec<u8>>>>);

    impl LinkSink for Collect {
        fn on_chunk(&self, _: &Arc<Link>, frames: &mut FrameBuffer, chunk: &[u8]) -> Result<()> {
            frames.append(chunk)?;
            while let Some(frame) = frames.try_extract_frame()? {
                let _ = self.0.lock().send(Some(frame));
            }
            Ok(())
        }

        fn on_link_down(&self, _: &Arc<Link>, _: Option<NetError>) {
            let _ = self.0.lock().send(None);
        }
    }

    #[test]
    fn pump_delivers_seed_then_socket_bytes() {
        let (dialer, acceptor) = socket_pair();
        let (tx, rx) = mpsc::channel();
        let (link, reader) = Link::open(acceptor).unwrap();
        let seed = crate::codec::frame(b"seeded").unwrap();
        spawn_reader(link.clone(), reader, seed, 64, Arc::new(Collect(Mutex::new(tx)))).unwrap();

        let (remote, _) = Link::open(dialer).unwrap();
        remote.send(&crate::codec::frame(b"live").unwrap()).unwrap();

        let wait = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(wait).unwrap().unwrap(), b"seeded");
        assert_eq!(rx.recv_timeout(wait).unwrap().unwrap(), b"live");

        remote.shutdown();
        assert_eq!(rx.recv_timeout(wait).unwrap(), None);
    }

    #[test]
    fn send_after_shutdown_fails() {
        let (dialer, _acceptor) = socket_pair();
        let (link, _reader) = Link::open(dialer).unwrap();
        link.shutdown();
        link.shutdown();
        assert!(!link.is_connected());
        assert_eq!(link.send(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
    }
}
