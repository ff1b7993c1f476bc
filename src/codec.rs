//! Wire envelope codec.
//!
//! ```text
//! frame     = varint(len) payload[len]
//! payload   = envelope                          compression disabled
//!           | varint(0) envelope                enabled, below threshold
//!           | varint(raw_len) deflate(envelope) enabled, at/above threshold
//! envelope  = varint(packet_key) body
//! ```
//!
//! `raw_len` is a size hint only and is never checked against the
//! decompressed output. Envelopes whose key is not registered decode to
//! `None` so newer peers can send types older peers do not know.

use std::sync::Arc;

use crate::buf::{PacketReader, PacketWriter, peek_varint, put_varint, varint_len};
use crate::compress::{Compression, Compressor, DeflateCompressor};
use crate::error::{NetError, Result};
use crate::filter::RawByteFilter;
use crate::frame_buffer::FrameBuffer;
use crate::packet::Packet;
use crate::registry::PacketRegistry;

/// Serializes `packet` as `varint(key) body`.
pub fn encode(packet: &dyn Packet) -> Result<Vec<u8>> {
    let mut w = PacketWriter::with_capacity(64);
    w.write_varint(packet.key());
    packet.write(&mut w)?;
    Ok(w.into_vec())
}

/// Wraps a serialized envelope in the compression header.
pub fn wrap_compression(envelope: &[u8], compressor: &dyn Compressor, threshold: usize) -> Result<Vec<u8>> {
    if envelope.len() >= threshold {
        let raw_len = u32::try_from(envelope.len())
            .map_err(|_| NetError::malformed(format!("envelope of {} bytes is too long", envelope.len())))?;
        let packed = compressor.compress(envelope)?;
        let mut out = Vec::with_capacity(varint_len(raw_len) + packed.len());
        put_varint(&mut out, raw_len);
        out.extend_from_slice(&packed);
        Ok(out)
    } else {
        let mut out = Vec::with_capacity(1 + envelope.len());
        put_varint(&mut out, 0);
        out.extend_from_slice(envelope);
        Ok(out)
    }
}

/// Strips the compression header, inflating the body when it was compressed.
pub fn unwrap_compression(payload: &[u8], compressor: &dyn Compressor) -> Result<Vec<u8>> {
    let (raw_len, used) =
        peek_varint(payload)?.ok_or_else(|| NetError::malformed("missing compression header"))?;
    let body = &payload[used..];
    if raw_len == 0 {
        Ok(body.to_vec())
    } else {
        compressor.decompress(body)
    }
}

/// Decodes an envelope into a registered packet type.
///
/// Unknown keys yield `Ok(None)`; a body the packet type cannot read is
/// [`NetError::Malformed`].
pub fn decode(envelope: Vec<u8>, registry: &PacketRegistry) -> Result<Option<Box<dyn Packet>>> {
    let mut r = PacketReader::new(envelope);
    let key = r.read_varint()?;
    let Some(mut packet) = registry.construct(key) else {
        log::trace!("dropping packet with unknown key {key}");
        return Ok(None);
    };
    packet.read(&mut r)?;
    Ok(Some(packet))
}

/// Prepends the varint length prefix.
///
/// Fails with [`NetError::Malformed`] when the payload is too long for the
/// 32-bit length field.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = frame_len(payload.len())?;
    let mut out = Vec::with_capacity(varint_len(len) + payload.len());
    put_varint(&mut out, len);
    out.extend_from_slice(payload);
    Ok(out)
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| NetError::malformed(format!("frame of {len} bytes is too long")))
}

/// The per-peer send and receive pipeline: compression settings, the
/// compressor, and the optional raw byte filter.
#[derive(Clone)]
pub struct WireCodec {
    compression: Compression,
    compressor: Arc<dyn Compressor>,
    filter: Option<Arc<dyn RawByteFilter>>,
}

impl WireCodec {
    /// Builds a pipeline from its parts; see also [`LinkConfig::codec`](crate::LinkConfig::codec).
    pub fn new(
        compression: Compression,
        compressor: Arc<dyn Compressor>,
        filter: Option<Arc<dyn RawByteFilter>>,
    ) -> Self {
        Self { compression, compressor, filter }
    }

    /// The compression settings in use.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Turns a packet into the exact bytes to put on the socket.
    pub fn outbound(&self, packet: &dyn Packet) -> Result<Vec<u8>> {
        let envelope = encode(packet)?;
        let payload = if self.compression.enabled {
            wrap_compression(&envelope, self.compressor.as_ref(), self.compression.threshold)?
        } else {
            envelope
        };
        let framed = frame(&payload)?;
        match &self.filter {
            Some(filter) => filter.write(framed),
            None => Ok(framed),
        }
    }

    /// Runs one received chunk through the filter and the frame buffer, then
    /// decodes every completed frame and hands it to `deliver` in order.
    pub fn ingest(
        &self,
        frames: &mut FrameBuffer,
        chunk: &[u8],
        registry: &PacketRegistry,
        mut deliver: impl FnMut(Box<dyn Packet>),
    ) -> Result<()> {
        match &self.filter {
            Some(filter) => frames.append(&filter.read(chunk)?)?,
            None => frames.append(chunk)?,
        }
        while let Some(payload) = frames.try_extract_frame()? {
            if let Some(packet) = self.open(payload, registry)? {
                deliver(packet);
            }
        }
        Ok(())
    }

    /// Decodes one frame payload.
    pub fn open(&self, payload: Vec<u8>, registry: &PacketRegistry) -> Result<Option<Box<dyn Packet>>> {
        let envelope = if self.compression.enabled {
            unwrap_compression(&payload, self.compressor.as_ref())?
        } else {
            payload
        };
        decode(envelope, registry)
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(Compression::default(), Arc::new(DeflateCompressor::default()), None)
    }
}

impl std::fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireCodec")
            .field("compression", &self.compression)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}
