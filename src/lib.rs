//! # bond-net - Typed Packets over Plain and Bonded TCP
//!
//! bond-net moves typed, length-prefixed packets between peers over TCP. A
//! peer is either a plain single-socket [`Connection`] or a bonded
//! [`Session`] that stripes its traffic over several sockets to get more
//! throughput and to survive the loss of individual sockets.
//!
//! ## Key Features
//!
//! - **Typed Packets**: applications implement [`Packet`] for their message
//!   types and register them once in a [`PacketRegistry`]
//! - **Connection Bonding**: a [`SessionClient`] negotiates a session id and
//!   opens the granted number of links; outbound packets go round-robin over
//!   them and inbound packets from every link reach one handler
//! - **Link Resilience**: losing a link only removes that link; a session
//!   stays usable while any link is alive
//! - **Optional Compression**: packets at or above a size threshold are
//!   deflated on the wire
//! - **Byte Filters**: a [`RawByteFilter`] sees every outgoing and incoming
//!   chunk, e.g. for encryption
//! - **Keep-Alive**: peers idle for longer than the configured timeout are
//!   disconnected by the owning manager's sweep
//!
//! ## Wire Format
//!
//! Every frame is `varint(len) || payload`, where the varint is unsigned
//! LEB128. The payload carries `varint(key) || body`; with compression
//! enabled it is wrapped as `varint(0) || envelope` below the threshold and
//! `varint(raw_len) || deflate(envelope)` at or above it. The first frame on
//! each socket is a control message, see [`Control`].
//!
//! ## Basic Usage
//!
//! ### Packets
//!
//! ```rust
//! use bond_net::{Packet, PacketReader, PacketRegistry, PacketWriter, Result};
//!
//! #[derive(Debug, Default)]
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Packet for Chat {
//!     fn key(&self) -> u32 {
//!         7
//!     }
//!
//!     fn write(&self, w: &mut PacketWriter) -> Result<()> {
//!         w.write_string(&self.text)?;
//!         Ok(())
//!     }
//!
//!     fn read(&mut self, r: &mut PacketReader) -> Result<()> {
//!         self.text = r.read_string()?;
//!         Ok(())
//!     }
//! }
//!
//! let registry = PacketRegistry::new();
//! registry.register::<Chat>()?;
//! assert!(registry.contains(7));
//! # Ok::<(), bond_net::NetError>(())
//! ```
//!
//! ### Server Side
//!
//! ```rust,no_run
//! use bond_net::{LinkConfig, Listener, PacketRegistry, Peer};
//! use std::sync::Arc;
//!
//! let config = LinkConfig::default().with_link_count(3);
//! let listener = Listener::bind("0.0.0.0:8080", Arc::new(PacketRegistry::new()), config)?;
//! listener.on_accept.set(|peer| {
//!     if let Peer::Bonded(session) = peer {
//!         session.set_packet_handler(|session: &bond_net::Session, packet: Box<dyn bond_net::Packet>| {
//!             session.send_packet(packet.as_ref());
//!         });
//!     }
//! });
//! listener.listen()?;
//! # Ok::<(), bond_net::NetError>(())
//! ```
//!
//! ### Client Side
//!
//! ```rust,no_run
//! use bond_net::{LinkConfig, PacketRegistry, SessionClient};
//! use std::sync::Arc;
//!
//! let config = LinkConfig::default().with_link_count(3);
//! let client = SessionClient::new("127.0.0.1:8080", Arc::new(PacketRegistry::new()), config);
//! let session = client.connect()?;
//! println!("bonded over {} links", session.link_count());
//! # Ok::<(), bond_net::NetError>(())
//! ```
//!
//! ## Configuration
//!
//! Everything tunable lives in [`LinkConfig`]: receive buffer size,
//! compression, byte filter, keep-alive, connect and handshake timeouts,
//! requested link count and the sweep intervals.
//!
//! ## Threading
//!
//! Each link runs its own receive thread; each listener runs one accept and
//! one sweep thread, and each client one updater thread. Packet handlers run
//! on the receive thread of the link the packet arrived on.

#![warn(missing_docs)]

mod buf;
mod client;
mod codec;
mod compress;
mod config;
mod connection;
mod error;
mod events;
mod filter;
mod frame_buffer;
mod handshake;
mod inbox;
mod link;
mod listener;
mod packet;
mod peer;
mod registry;
mod session;
mod transport;

pub use buf::{MAX_VARINT_LEN, PacketReader, PacketWriter, peek_varint, put_varint, varint_len};
pub use client::{Client, SessionClient};
pub use codec::{WireCodec, decode, encode, frame, unwrap_compression, wrap_compression};
pub use compress::{Compression, Compressor, DEFAULT_COMPRESSION_THRESHOLD, DeflateCompressor, ZlibCompressor};
pub use config::{DEFAULT_HANDSHAKE_TIMEOUT, LinkConfig};
pub use connection::{Connection, ConnectionFactory, default_connection_factory};
pub use error::{NetError, Result};
pub use events::EventSlot;
pub use filter::RawByteFilter;
pub use frame_buffer::{DEFAULT_CAPACITY, FrameBuffer};
pub use handshake::{CONTROL_BOND, CONTROL_PLAIN, Control, PendingBond};
pub use listener::{Listener, Peer};
pub use packet::{AsAny, Packet, PacketHandler, SharedHandler};
pub use peer::{NoHooks, PeerHooks, PeerState};
pub use registry::PacketRegistry;
pub use session::{Session, SessionFactory, default_session_factory};
