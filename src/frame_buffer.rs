//! Reassembly buffer for length-prefixed frames.
//!
//! Received chunks are appended at the write offset; complete frames are
//! copied out from the front and the unread tail is shifted back to offset 0.
//! One `append` may complete several frames or only part of one, so callers
//! loop on [`FrameBuffer::try_extract_frame`] until it yields `None`.
//!
//! No maximum frame size is enforced here.

use crate::buf::peek_varint;
use crate::error::{NetError, Result};

/// Default initial capacity, matching the default receive chunk size.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Growable store of received bytes not yet turned into frames.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Backing store. Its length is the capacity; bytes past `offset` are junk.
    store: Vec<u8>,
    /// Write offset: count of buffered, unread bytes.
    offset: usize,
}

impl FrameBuffer {
    /// An empty buffer of [`DEFAULT_CAPACITY`] bytes.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// An empty buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { store: vec![0; capacity], offset: 0 }
    }

    /// Copies `chunk` in behind the buffered bytes.
    ///
    /// When the store is too small it grows to `capacity + chunk.len()`.
    /// Compaction on extraction reclaims consumed space, so growth is linear
    /// rather than doubling. The store never shrinks.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let needed = self.offset + chunk.len();
        if self.store.len() < needed {
            let grow = chunk.len();
            self.store
                .try_reserve_exact(grow)
                .map_err(|source| NetError::CapacityGrowth { requested: grow, source })?;
            let new_capacity = self.store.len() + grow;
            self.store.resize(new_capacity, 0);
        }
        self.store[self.offset..needed].copy_from_slice(chunk);
        self.offset = needed;
        Ok(())
    }

    /// Pops the next complete frame payload, if one is fully buffered.
    ///
    /// Nothing is consumed when either the length prefix or the payload is
    /// still incomplete. A zero-length frame yields an empty payload.
    pub fn try_extract_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some((length, prefix)) = peek_varint(&self.store[..self.offset])? else {
            return Ok(None);
        };
        let end = prefix + length as usize;
        if self.offset < end {
            return Ok(None);
        }
        let payload = self.store[prefix..end].to_vec();
        self.store.copy_within(end..self.offset, 0);
        self.offset -= end;
        Ok(Some(payload))
    }

    /// Drains every buffered byte, leaving the buffer empty.
    ///
    /// Used to hand bytes that trail a handshake message over to the link's
    /// own buffer.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        let rest = self.store[..self.offset].to_vec();
        self.offset = 0;
        rest
    }

    /// Buffered, unread bytes.
    pub fn len(&self) -> usize {
        self.offset
    }

    /// No bytes buffered.
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Current size of the backing store.
    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// Discards buffered bytes; capacity is kept.
    pub fn clear(&mut self) {
        self.offset = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame;

    fn drain(buffer: &mut FrameBuffer) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(f) = buffer.try_extract_frame().unwrap() {
            out.push(f);
        }
        out
    }

    #[test]
    fn single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        buffer.append(&frame(b"hello").unwrap()).unwrap();
        assert_eq!(drain(&mut buffer), vec![b"hello".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_append() {
        let mut buffer = FrameBuffer::new();
        let mut wire = frame(b"first").unwrap();
        wire.extend(frame(b"second").unwrap());
        wire.extend(frame(b"third").unwrap());
        buffer.append(&wire).unwrap();
        assert_eq!(drain(&mut buffer), vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn partial_payload_is_retained() {
        let mut buffer = FrameBuffer::new();
        let wire = frame(b"fragmented payload").unwrap();
        buffer.append(&wire[..6]).unwrap();
        assert!(buffer.try_extract_frame().unwrap().is_none());
        assert_eq!(buffer.len(), 6);

        buffer.append(&wire[6..]).unwrap();
        assert_eq!(buffer.try_extract_frame().unwrap().unwrap(), b"fragmented payload");
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_length_prefix_is_retained() {
        let payload = vec![7u8; 300];
        let wire = frame(&payload).unwrap();
        let mut buffer = FrameBuffer::new();
        buffer.append(&wire[..1]).unwrap();
        assert!(buffer.try_extract_frame().unwrap().is_none());
        buffer.append(&wire[1..]).unwrap();
        assert_eq!(buffer.try_extract_frame().unwrap().unwrap(), payload);
    }

    #[test]
    fn zero_length_frame_is_a_frame() {
        let mut buffer = FrameBuffer::new();
        let mut wire = frame(b"").unwrap();
        wire.extend(frame(b"after").unwrap());
        buffer.append(&wire).unwrap();
        assert_eq!(drain(&mut buffer), vec![Vec::new(), b"after".to_vec()]);
    }

    #[test]
    fn grows_by_incoming_size() {
        let mut buffer = FrameBuffer::with_capacity(4);
        buffer.append(&[1, 2, 3]).unwrap();
        buffer.append(&[4, 5, 6]).unwrap();
        assert_eq!(buffer.capacity(), 7);
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn compaction_reuses_space() {
        let mut buffer = FrameBuffer::with_capacity(16);
        for _ in 0..100 {
            buffer.append(&frame(b"0123456789").unwrap()).unwrap();
            assert_eq!(buffer.try_extract_frame().unwrap().unwrap(), b"0123456789");
        }
        assert_eq!(buffer.capacity(), 16);
    }

    #[test]
    fn take_remaining_empties_buffer() {
        let mut buffer = FrameBuffer::new();
        let mut wire = frame(b"ctl").unwrap();
        wire.extend_from_slice(&[9, 9]);
        buffer.append(&wire).unwrap();
        buffer.try_extract_frame().unwrap().unwrap();
        assert_eq!(buffer.take_remaining(), vec![9, 9]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn malformed_prefix_is_an_error() {
        let mut buffer = FrameBuffer::new();
        buffer.append(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap();
        assert!(matches!(buffer.try_extract_frame(), Err(NetError::Malformed(_))));
    }
}
