//! Runtime settings for listeners, clients and the peers they create.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::WireCodec;
use crate::compress::{Compression, Compressor, DeflateCompressor};
use crate::filter::RawByteFilter;
use crate::frame_buffer::DEFAULT_CAPACITY;

/// How long a freshly accepted or dialed socket may take to deliver its
/// control message.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration shared by every manager type.
///
/// Durations of zero disable the corresponding feature.
#[derive(Clone)]
pub struct LinkConfig {
    /// Size of each socket read, and initial capacity of each link's frame buffer.
    pub receive_buffer_size: usize,
    /// Whether, and from what size, packets are deflated.
    pub compression: Compression,
    /// Used for packets at or above the compression threshold.
    pub compressor: Arc<dyn Compressor>,
    /// Sees every outgoing frame and incoming chunk.
    pub filter: Option<Arc<dyn RawByteFilter>>,
    /// Idle time after which a peer is disconnected. Zero disables.
    pub keep_alive: Duration,
    /// Per-socket connect timeout. Zero means a blocking connect.
    pub connect_timeout: Duration,
    /// Clients: links requested per bonded session. Listeners: the most
    /// links granted to one session.
    pub link_count: usize,
    /// Sweep period while peers exist.
    pub sweep_interval: Duration,
    /// Sweep period while a listener has no peers.
    pub idle_sweep_interval: Duration,
    /// Time allowed for the first control message of a new socket. Zero waits
    /// forever. Defaults to [`DEFAULT_HANDSHAKE_TIMEOUT`].
    pub handshake_timeout: Duration,
    /// `TCP_NODELAY` on every link.
    pub nodelay: bool,
}

impl LinkConfig {
    /// Sets the read size; at least 1.
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size.max(1);
        self
    }

    /// Sets [`compression`](Self::compression).
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Replaces the deflate compressor, e.g. with [`ZlibCompressor`](crate::ZlibCompressor).
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Sets [`filter`](Self::filter).
    pub fn with_filter(mut self, filter: Arc<dyn RawByteFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets [`keep_alive`](Self::keep_alive).
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets [`connect_timeout`](Self::connect_timeout).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the requested (client) or maximum (listener) link count; at least 1.
    pub fn with_link_count(mut self, links: usize) -> Self {
        self.link_count = links.max(1);
        self
    }

    /// Sets [`sweep_interval`](Self::sweep_interval).
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets [`idle_sweep_interval`](Self::idle_sweep_interval).
    pub fn with_idle_sweep_interval(mut self, interval: Duration) -> Self {
        self.idle_sweep_interval = interval;
        self
    }

    /// Sets [`handshake_timeout`](Self::handshake_timeout).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets [`nodelay`](Self::nodelay).
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// The send/receive pipeline these settings describe.
    pub fn codec(&self) -> WireCodec {
        WireCodec::new(self.compression, self.compressor.clone(), self.filter.clone())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_CAPACITY,
            compression: Compression::default(),
            compressor: Arc::new(DeflateCompressor::default()),
            filter: None,
            keep_alive: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            link_count: 1,
            sweep_interval: Duration::from_millis(50),
            idle_sweep_interval: Duration::from_millis(800),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            nodelay: true,
        }
    }
}

impl std::fmt::Debug for LinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkConfig")
            .field("receive_buffer_size", &self.receive_buffer_size)
            .field("compression", &self.compression)
            .field("filtered", &self.filter.is_some())
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("link_count", &self.link_count)
            .field("sweep_interval", &self.sweep_interval)
            .field("idle_sweep_interval", &self.idle_sweep_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("nodelay", &self.nodelay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_wait_is_bounded_by_default() {
        let config = LinkConfig::default();
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(!config.handshake_timeout.is_zero());
        assert!(LinkConfig::default().with_handshake_timeout(Duration::ZERO).handshake_timeout.is_zero());
    }

    #[test]
    fn counts_are_clamped_to_one() {
        let config = LinkConfig::default().with_link_count(0).with_receive_buffer_size(0);
        assert_eq!(config.link_count, 1);
        assert_eq!(config.receive_buffer_size, 1);
    }
}
