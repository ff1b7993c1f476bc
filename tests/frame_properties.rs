use bond_net::{Compression, DeflateCompressor, FrameBuffer, PacketRegistry, WireCodec, frame};
use proptest::prelude::*;
use std::sync::Arc;

mod common;
use common::Sample;

/// Splits `bytes` at the given cut points.
fn chunks(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
    points.push(0);
    points.push(bytes.len());
    points.sort_unstable();
    points.dedup();
    points.windows(2).map(|w| bytes[w[0]..w[1]].to_vec()).collect()
}

proptest! {
    #[test]
    fn frames_survive_any_chunking(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..20),
        cuts in prop::collection::vec(any::<usize>(), 0..40),
        capacity in 1usize..64,
    ) {
        let wire: Vec<u8> = payloads.iter().flat_map(|p| frame(p).unwrap()).collect();
        let mut buffer = FrameBuffer::with_capacity(capacity);
        let mut out = Vec::new();
        for chunk in chunks(&wire, &cuts) {
            buffer.append(&chunk).unwrap();
            while let Some(f) = buffer.try_extract_frame().unwrap() {
                out.push(f);
            }
        }
        prop_assert_eq!(out, payloads);
        prop_assert!(buffer.is_empty());
    }

    #[test]
    fn packets_survive_any_chunking_with_compression(
        texts in prop::collection::vec("[a-z ]{0,120}", 1..10),
        cuts in prop::collection::vec(any::<usize>(), 0..20),
        threshold in 1usize..100,
    ) {
        let registry = PacketRegistry::new();
        registry.register::<Sample>().unwrap();
        let codec = WireCodec::new(Compression::enabled(threshold), Arc::new(DeflateCompressor::default()), None);

        let wire: Vec<u8> = texts
            .iter()
            .flat_map(|t| codec.outbound(&Sample::new(t.clone())).unwrap())
            .collect();
        let mut buffer = FrameBuffer::new();
        let mut out = Vec::new();
        for chunk in chunks(&wire, &cuts) {
            codec
                .ingest(&mut buffer, &chunk, &registry, |p| out.push(p.downcast_ref::<Sample>().unwrap().data.clone()))
                .unwrap();
        }
        prop_assert_eq!(out, texts);
    }
}
