//! Pluggable compression used by the envelope wrapper.

use std::io::{Read, Write};

use flate2::Compression as Level;
use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, ZlibEncoder};

use crate::error::{NetError, Result};

/// Default minimum envelope size, in bytes, that gets compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 50;

/// Compression capability. Both peers must use the same algorithm.
pub trait Compressor: Send + Sync {
    /// Compresses one whole envelope.
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;
    /// Inflates what [`compress`](Self::compress) produced. Corrupt input is
    /// [`NetError::Compression`].
    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// Raw deflate stream, no header or checksum. This is the default.
#[derive(Debug, Clone, Copy)]
pub struct DeflateCompressor {
    level: Level,
}

impl DeflateCompressor {
    /// `level` runs from 0 (store) to 9 (best).
    pub fn new(level: u32) -> Self {
        Self { level: Level::new(level) }
    }
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self { level: Level::default() }
    }
}

impl Compressor for DeflateCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(input.len() / 2), self.level);
        encoder.write_all(input).map_err(NetError::Compression)?;
        encoder.finish().map_err(NetError::Compression)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 2);
        DeflateDecoder::new(input).read_to_end(&mut out).map_err(NetError::Compression)?;
        Ok(out)
    }
}

/// Deflate with the two-byte zlib header and adler32 trailer.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: Level,
}

impl ZlibCompressor {
    /// `level` runs from 0 (store) to 9 (best).
    pub fn new(level: u32) -> Self {
        Self { level: Level::new(level) }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self { level: Level::default() }
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len() / 2), self.level);
        encoder.write_all(input).map_err(NetError::Compression)?;
        encoder.finish().map_err(NetError::Compression)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 2);
        ZlibDecoder::new(input).read_to_end(&mut out).map_err(NetError::Compression)?;
        Ok(out)
    }
}

/// Whether envelopes are wrapped, and from which size they get compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    /// Off means no compression header at all; both peers must agree.
    pub enabled: bool,
    /// Envelopes of at least this many bytes are deflated.
    pub threshold: usize,
}

impl Compression {
    /// Compression on, from `threshold` bytes.
    pub fn enabled(threshold: usize) -> Self {
        Self { enabled: true, threshold }
    }

    /// No compression header.
    pub fn disabled() -> Self {
        Self { enabled: false, threshold: DEFAULT_COMPRESSION_THRESHOLD }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog ".repeat(20)
    }

    #[test]
    fn deflate_restores_input() {
        let c = DeflateCompressor::default();
        let packed = c.compress(&sample()).unwrap();
        assert!(packed.len() < sample().len());
        assert_eq!(c.decompress(&packed).unwrap(), sample());
    }

    #[test]
    fn zlib_carries_header() {
        let c = ZlibCompressor::default();
        let packed = c.compress(&sample()).unwrap();
        assert_eq!(packed[0], 0x78);
        assert_eq!(c.decompress(&packed).unwrap(), sample());
    }

    #[test]
    fn garbage_fails_to_decompress() {
        let c = ZlibCompressor::default();
        assert!(matches!(c.decompress(&[1, 2, 3, 4]), Err(NetError::Compression(_))));
    }

    #[test]
    fn default_threshold_is_fifty() {
        let c = Compression::default();
        assert!(!c.enabled);
        assert_eq!(c.threshold, 50);
    }
}
