//! Hook that sees raw bytes right after they are received and right before
//! they are sent, e.g. for an outer encryption layer.

use crate::error::Result;

/// Byte transform applied at the socket boundary.
///
/// `read` is applied to every received chunk before it is buffered, `write`
/// to every framed outbound message before it hits the socket. Bonding
/// control messages bypass the filter.
pub trait RawByteFilter: Send + Sync {
    /// Transforms one received chunk. Chunk boundaries are arbitrary.
    fn read(&self, received: &[u8]) -> Result<Vec<u8>>;
    /// Transforms one whole outbound frame.
    fn write(&self, outgoing: Vec<u8>) -> Result<Vec<u8>>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// XOR with a fixed key. Symmetric, so `read` undoes `write`.
    pub(crate) struct XorFilter(pub u8);

    impl RawByteFilter for XorFilter {
        fn read(&self, received: &[u8]) -> Result<Vec<u8>> {
            Ok(received.iter().map(|b| b ^ self.0).collect())
        }

        fn write(&self, mut outgoing: Vec<u8>) -> Result<Vec<u8>> {
            outgoing.iter_mut().for_each(|b| *b ^= self.0);
            Ok(outgoing)
        }
    }

    #[test]
    fn xor_filter_is_symmetric() {
        let f = XorFilter(0x5a);
        let out = f.write(b"payload".to_vec()).unwrap();
        assert_ne!(out, b"payload");
        assert_eq!(f.read(&out).unwrap(), b"payload");
    }
}
