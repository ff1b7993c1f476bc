//! The packet capability and the handler callbacks packets are delivered to.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::buf::{PacketReader, PacketWriter};
use crate::error::Result;

/// Upcast helper so `dyn Packet` can be downcast to its concrete type.
pub trait AsAny: Any {
    /// Borrow as `Any`.
    fn as_any(&self) -> &dyn Any;
    /// Box as `Any`.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A typed message carried in one frame.
///
/// `key` identifies the type on the wire and must be unique within a
/// [`PacketRegistry`](crate::PacketRegistry). Receivers build a
/// `Default` instance and call `read`, so `read` must restore everything
/// `write` produced.
///
/// ```
/// use bond_net::{Packet, PacketReader, PacketWriter, Result};
///
/// #[derive(Debug, Default, PartialEq)]
/// struct Chat {
///     text: String,
/// }
///
/// impl Packet for Chat {
///     fn key(&self) -> u32 {
///         1
///     }
///
///     fn write(&self, w: &mut PacketWriter) -> Result<()> {
///         w.write_string(&self.text)?;
///         Ok(())
///     }
///
///     fn read(&mut self, r: &mut PacketReader) -> Result<()> {
///         self.text = r.read_string()?;
///         Ok(())
///     }
/// }
/// ```
pub trait Packet: AsAny + Send + fmt::Debug {
    /// Wire identifier of this type.
    fn key(&self) -> u32;
    /// Serializes the body, without the key.
    fn write(&self, w: &mut PacketWriter) -> Result<()>;
    /// Fills `self` from a body produced by [`write`](Self::write).
    fn read(&mut self, r: &mut PacketReader) -> Result<()>;
}

impl dyn Packet {
    /// The concrete type is `T`.
    pub fn is<T: Packet>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }

    /// Borrows the concrete packet if it is a `T`.
    pub fn downcast_ref<T: Packet>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    /// Recovers the concrete packet, handing the box back on a type mismatch.
    pub fn downcast<T: Packet>(self: Box<Self>) -> std::result::Result<Box<T>, Box<dyn Packet>> {
        if self.is::<T>() {
            Ok(AsAny::into_any(self)
                .downcast::<T>()
                .unwrap_or_else(|_| unreachable!("type checked above")))
        } else {
            Err(self)
        }
    }
}

/// Receives decoded packets for a peer of type `P` (a
/// [`Connection`](crate::Connection) or a [`Session`](crate::Session)).
///
/// Runs on the link's receive thread. For sessions, links deliver
/// concurrently, so handlers may be entered from several threads at once.
pub trait PacketHandler<P: ?Sized>: Send + Sync {
    /// Takes one packet received by `peer`.
    fn handle(&self, peer: &P, packet: Box<dyn Packet>);
}

impl<P: ?Sized, F> PacketHandler<P> for F
where
    F: Fn(&P, Box<dyn Packet>) + Send + Sync,
{
    fn handle(&self, peer: &P, packet: Box<dyn Packet>) {
        self(peer, packet)
    }
}

/// Shared handler slot value.
pub type SharedHandler<P> = Arc<dyn PacketHandler<P>>;
