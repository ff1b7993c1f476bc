//! Bonding control sub-protocol.
//!
//! The first frame on every new socket is a control message, sent by the
//! side that dialed:
//!
//! ```text
//! 0x01                                  plain single-link connection
//! 0x00 varint(link_count) id[16]        bond
//! ```
//!
//! A bond with `link_count > 0` asks for a new session of that many links;
//! the acceptor answers on the same socket with a bond carrying the granted
//! count and the freshly minted session id. A bond with `link_count == 0`
//! attaches the socket to the existing session `id` and gets no answer.
//!
//! The id is written in the little-endian field layout of
//! [`Uuid::to_bytes_le`]. Control frames are length-prefixed like data
//! frames but never compressed or filtered.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use uuid::Uuid;

use crate::buf::{PacketReader, PacketWriter};
use crate::codec::frame;
use crate::error::{NetError, Result};
use crate::frame_buffer::FrameBuffer;

/// Control byte of a plain single-link connection.
pub const CONTROL_PLAIN: u8 = 0x01;
/// Control byte of a bond request, reply or attach.
pub const CONTROL_BOND: u8 = 0x00;

const HANDSHAKE_CHUNK: usize = 512;

/// A decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// The socket carries one plain connection.
    Plain,
    /// Bonding. From a client, `link_count > 0` asks for a new session and
    /// `0` attaches to `session_id`; the server replies with the granted
    /// count and the minted id.
    Bond {
        /// Requested or granted links; `0` for an attach.
        link_count: u32,
        /// Nil in a new-session request.
        session_id: Uuid,
    },
}

impl Control {
    /// Request for a new session of `link_count` links.
    pub fn new_session(link_count: u32) -> Self {
        Control::Bond { link_count: link_count.max(1), session_id: Uuid::nil() }
    }

    /// Request to join session `session_id`.
    pub fn attach(session_id: Uuid) -> Self {
        Control::Bond { link_count: 0, session_id }
    }

    /// Control body, without the frame length.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(22);
        match self {
            Control::Plain => {
                w.write_u8(CONTROL_PLAIN);
            }
            Control::Bond { link_count, session_id } => {
                w.write_u8(CONTROL_BOND).write_varint(*link_count).write_uuid(session_id);
            }
        }
        w.into_vec()
    }

    /// Parses a control body. An unknown first byte is a [`NetError::Handshake`].
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(body.to_vec());
        match r.read_u8()? {
            CONTROL_PLAIN => Ok(Control::Plain),
            CONTROL_BOND => {
                let link_count = r.read_varint()?;
                let session_id = r.read_uuid()?;
                Ok(Control::Bond { link_count, session_id })
            }
            other => Err(NetError::Handshake(format!("unknown control byte {other:#04x}"))),
        }
    }
}

/// A connected socket whose control message has not been exchanged yet.
///
/// Bytes that arrive behind the control frame stay buffered and are handed
/// over by [`into_parts`](Self::into_parts).
#[derive(Debug)]
pub struct PendingBond {
    stream: TcpStream,
    frames: FrameBuffer,
}

impl PendingBond {
    /// Starts the exchange on a freshly connected socket.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream, frames: FrameBuffer::with_capacity(HANDSHAKE_CHUNK) }
    }

    /// Remote address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Writes one framed control message.
    pub fn send(&mut self, message: &Control) -> Result<()> {
        self.stream.write_all(&frame(&message.encode())?)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Waits for one control message. A zero `timeout` waits indefinitely.
    pub fn receive(&mut self, timeout: Duration) -> Result<Control> {
        if timeout.is_zero() {
            return self.read_control();
        }
        self.stream.set_read_timeout(Some(timeout))?;
        let result = self.read_control();
        self.stream.set_read_timeout(None)?;
        result
    }

    fn read_control(&mut self) -> Result<Control> {
        let mut chunk = [0u8; HANDSHAKE_CHUNK];
        loop {
            if let Some(body) = self.frames.try_extract_frame()? {
                return Control::decode(&body);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(NetError::Handshake("socket closed before control message".into())),
                Ok(n) => self.frames.append(&chunk[..n])?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Err(NetError::Handshake("timed out waiting for control message".into()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The socket and whatever was read past the control frame.
    pub fn into_parts(mut self) -> (TcpStream, Vec<u8>) {
        let rest = self.frames.take_remaining();
        (self.stream, rest)
    }
}
