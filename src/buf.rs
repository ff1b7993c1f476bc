//! Byte cursors that packets serialize through, plus the varint encoding
//! used for frame lengths and packet keys.
//!
//! A varint is unsigned LEB128 over `u32`: seven data bits per byte, least
//! significant group first, the high bit set on every byte but the last.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{NetError, Result};

/// Largest number of bytes a `u32` varint may occupy.
pub const MAX_VARINT_LEN: usize = 5;

/// Appends `value` as a varint.
pub fn put_varint(dst: &mut impl BufMut, mut value: u32) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Number of bytes `value` occupies once varint-encoded.
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Reads a varint from the front of `src` without consuming anything.
///
/// Returns `Ok(None)` if `src` ends before the varint does, otherwise the
/// value and the number of bytes it spans.
pub fn peek_varint(src: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value: u32 = 0;
    for (i, &byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        let bits = (byte & 0x7f) as u32;
        if i == MAX_VARINT_LEN - 1 && bits > 0x0f {
            return Err(NetError::malformed("varint overflows u32"));
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(NetError::malformed("varint longer than 5 bytes"));
    }
    Ok(None)
}

/// Growable output buffer handed to [`Packet::write`](crate::Packet::write).
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Creates a writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity) }
    }

    /// Unsigned LEB128.
    pub fn write_varint(&mut self, value: u32) -> &mut Self {
        put_varint(&mut self.buf, value);
        self
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// `1` for `true`, `0` for `false`.
    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(value as u8);
        self
    }

    /// Big-endian, like every fixed-width write below.
    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    /// Writes a big-endian `i32`.
    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    /// Writes a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Writes a big-endian `i64`.
    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    /// Writes a big-endian `u64`.
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// IEEE 754 bits, big-endian.
    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_f32(value);
        self
    }

    /// IEEE 754 bits, big-endian.
    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.buf.put_f64(value);
        self
    }

    /// Raw bytes, no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Varint length followed by the bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| NetError::malformed(format!("byte array of {} bytes is too long", bytes.len())))?;
        put_varint(&mut self.buf, len);
        self.buf.put_slice(bytes);
        Ok(self)
    }

    /// Varint byte length followed by UTF-8.
    pub fn write_string(&mut self, value: &str) -> Result<&mut Self> {
        self.write_bytes(value.as_bytes())
    }

    /// 16 bytes in the little-endian field layout of [`Uuid::to_bytes_le`].
    pub fn write_uuid(&mut self, value: &Uuid) -> &mut Self {
        self.buf.put_slice(&value.to_bytes_le());
        self
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Nothing written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Read cursor handed to [`Packet::read`](crate::Packet::read).
///
/// Every accessor fails with [`NetError::Malformed`] instead of panicking
/// when the body is shorter than expected.
#[derive(Debug, Clone)]
pub struct PacketReader {
    buf: Bytes,
}

impl PacketReader {
    /// Reads from the start of `bytes`.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { buf: bytes.into() }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(NetError::malformed(format!(
                "truncated {what}: need {n} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Unsigned LEB128; an overlong or truncated varint is malformed.
    pub fn read_varint(&mut self) -> Result<u32> {
        match peek_varint(self.buf.chunk())? {
            Some((value, used)) => {
                self.buf.advance(used);
                Ok(value)
            }
            None => Err(NetError::malformed("truncated varint")),
        }
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    /// Any non-zero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    /// Reads a big-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    /// Reads a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    /// Reads a big-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    /// Reads a big-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    /// Reads a big-endian `f32`.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.need(4, "f32")?;
        Ok(self.buf.get_f32())
    }

    /// Reads a big-endian `f64`.
    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8, "f64")?;
        Ok(self.buf.get_f64())
    }

    /// Exactly `n` raw bytes.
    pub fn read_raw(&mut self, n: usize) -> Result<Bytes> {
        self.need(n, "raw bytes")?;
        Ok(self.buf.split_to(n))
    }

    /// Everything that is left.
    pub fn read_rest(&mut self) -> Bytes {
        let n = self.buf.remaining();
        self.buf.split_to(n)
    }

    /// Varint length followed by the bytes.
    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_varint()? as usize;
        self.read_raw(len)
    }

    /// Varint byte length followed by UTF-8; invalid UTF-8 is malformed.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::malformed(format!("invalid UTF-8 string: {e}")))
    }

    /// Counterpart of [`PacketWriter::write_uuid`].
    pub fn read_uuid(&mut self) -> Result<Uuid> {
        let raw = self.read_raw(16)?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&raw);
        Ok(Uuid::from_bytes_le(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        put_varint(&mut out, value);
        out
    }

    #[test]
    fn varint_known_encodings() {
        assert_eq!(encoded(0), [0x00]);
        assert_eq!(encoded(1), [0x01]);
        assert_eq!(encoded(127), [0x7f]);
        assert_eq!(encoded(128), [0x80, 0x01]);
        assert_eq!(encoded(300), [0xac, 0x02]);
        assert_eq!(encoded(u32::MAX), [0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn varint_len_matches_encoding() {
        for value in [0, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, 268_435_455, 268_435_456, u32::MAX] {
            assert_eq!(varint_len(value), encoded(value).len(), "value {value}");
        }
    }

    #[test]
    fn peek_varint_incomplete_returns_none() {
        assert!(peek_varint(&[]).unwrap().is_none());
        assert!(peek_varint(&[0x80]).unwrap().is_none());
        assert!(peek_varint(&[0xff, 0xff, 0xff, 0xff]).unwrap().is_none());
    }

    #[test]
    fn peek_varint_ignores_trailing_bytes() {
        assert_eq!(peek_varint(&[0xac, 0x02, 0x99, 0x99]).unwrap(), Some((300, 2)));
    }

    #[test]
    fn peek_varint_rejects_overlong() {
        assert!(peek_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
        assert!(peek_varint(&[0xff, 0xff, 0xff, 0xff, 0x1f]).is_err());
    }

    #[test]
    fn writer_reader_mixed_fields() {
        let id = Uuid::new_v4();
        let mut w = PacketWriter::new();
        w.write_varint(42).write_bool(true).write_i32(-5).write_u64(9).write_uuid(&id);
        w.write_string("héllo").unwrap();
        w.write_bytes(&[1, 2, 3]).unwrap();

        let mut r = PacketReader::new(w.into_vec());
        assert_eq!(r.read_varint().unwrap(), 42);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_i32().unwrap(), -5);
        assert_eq!(r.read_u64().unwrap(), 9);
        assert_eq!(r.read_uuid().unwrap(), id);
        assert_eq!(r.read_string().unwrap(), "héllo");
        assert_eq!(&r.read_bytes().unwrap()[..], &[1, 2, 3]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn reader_reports_truncation() {
        let mut r = PacketReader::new(vec![0x00, 0x01]);
        let err = r.read_u32().unwrap_err();
        assert!(matches!(err, NetError::Malformed(_)));

        let mut r = PacketReader::new(vec![0x05, b'a', b'b']);
        assert!(r.read_string().is_err());
    }
}
