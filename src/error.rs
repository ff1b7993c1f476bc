//! Error types shared by every layer of the crate.

use std::collections::TryReserveError;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the framing, codec, registry and transport layers.
#[derive(Debug, Error)]
pub enum NetError {
    /// A packet key was registered twice on the same registry.
    #[error("packet key {key} already registered by {existing}, cannot register {attempted}")]
    DuplicateKey {
        /// The contested key.
        key: u32,
        /// Type that already owns the key.
        existing: &'static str,
        /// Type whose registration was refused.
        attempted: &'static str,
    },

    /// Any I/O failure on a socket.
    #[error("transport fault: {0}")]
    Transport(#[from] std::io::Error),

    /// A connect attempt did not complete in time.
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Address that was being dialed.
        addr: SocketAddr,
        /// The configured timeout.
        timeout: Duration,
    },

    /// An attach request named a session this side does not know.
    #[error("no bonded session accepts links for id {0}")]
    BondingMismatch(Uuid),

    /// The frame buffer could not grow its backing store.
    #[error("frame buffer could not grow by {requested} bytes")]
    CapacityGrowth {
        /// Number of additional bytes that were requested.
        requested: usize,
        /// Allocator failure.
        #[source]
        source: TryReserveError,
    },

    /// Bytes on the wire did not decode.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// The bonding control exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The compressor rejected its input.
    #[error("compression failure: {0}")]
    Compression(#[source] std::io::Error),

    /// The peer is no longer open.
    #[error("closed")]
    Closed,
}

impl NetError {
    /// Returns the innermost error of the `source()` chain.
    ///
    /// Transport faults are often wrapped several layers deep; this is what
    /// gets reported to fault hooks and logs.
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let mut current: &(dyn StdError + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }

    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        NetError::Malformed(what.into())
    }
}

/// Result type alias using [`NetError`].
pub type Result<T> = std::result::Result<T, NetError>;
