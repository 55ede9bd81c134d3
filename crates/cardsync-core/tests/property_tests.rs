//! Property-based tests for chunking, reassembly and handshake codes
//!
//! Uses proptest to check the invariants the wire protocol relies on.

use bytes::Bytes;
use proptest::prelude::*;
use cardsync_core::protocol::{chunk_count, ChunkHeader};
use cardsync_core::reassembly::{split_chunks, ChunkStatus, Reassembler};
use cardsync_core::signaling::{EndpointInfo, SessionDescription, SessionId};
use cardsync_core::{CardId, HandshakeError, SignalingCodec, DEFAULT_CHUNK_SIZE};

// ============================================================================
// Strategy Generators
// ============================================================================

/// Blobs from empty up to a few chunks long
fn blob_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..(3 * DEFAULT_CHUNK_SIZE + 100)).prop_map(Bytes::from)
}

/// Sender chunk sizes, never coarser than the receiver accepts
fn chunk_size_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![
        2 => Just(DEFAULT_CHUNK_SIZE),
        1 => 1usize..=DEFAULT_CHUNK_SIZE,
    ]
}

fn address_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        (any::<[u8; 4]>(), 1024u16..65535).prop_map(|(ip, port)| {
            format!("{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
        }),
        1..6,
    )
}

/// How the control and binary channels interleave for one record
#[derive(Debug, Clone, Copy)]
enum Arrival {
    /// chunk_start, chunks, chunk_complete
    InOrder,
    /// Every chunk overtakes chunk_start
    ChunksFirst,
    /// chunk_complete overtakes the last chunk
    CompleteEarly,
}

fn arrival_strategy() -> impl Strategy<Value = Arrival> {
    prop_oneof![
        Just(Arrival::InOrder),
        Just(Arrival::ChunksFirst),
        Just(Arrival::CompleteEarly),
    ]
}

fn completed_in(statuses: impl IntoIterator<Item = ChunkStatus>) -> Option<Bytes> {
    statuses.into_iter().find_map(|status| match status {
        ChunkStatus::Accepted {
            completed: Some(record),
            ..
        } => Some(record.data),
        _ => None,
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Chunks never exceed the chunk size, cover the blob exactly, and
    /// match the count announced in chunk_start
    #[test]
    fn split_covers_blob(data in blob_strategy(), chunk_size in chunk_size_strategy()) {
        let chunks: Vec<Bytes> = split_chunks(&data, chunk_size).collect();

        prop_assert_eq!(chunks.len() as u32, chunk_count(data.len() as u64, chunk_size));
        prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= chunk_size));
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        prop_assert_eq!(&joined[..], &data[..]);
    }

    /// Every blob reassembles byte-for-byte however the two channels
    /// interleave
    #[test]
    fn reassembly_is_exact(
        data in blob_strategy(),
        chunk_size in chunk_size_strategy(),
        arrival in arrival_strategy(),
        record_index in 0u32..1000,
    ) {
        let mut reassembler = Reassembler::new(DEFAULT_CHUNK_SIZE, 4 * 1024 * 1024);
        let card_id = CardId::new();
        let chunks: Vec<Bytes> = split_chunks(&data, chunk_size).collect();
        let total = chunks.len() as u32;
        let size = data.len() as u64;

        let result = match arrival {
            Arrival::InOrder => {
                prop_assert!(reassembler.start(record_index, card_id, total, size).unwrap().is_empty());
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let status = reassembler.chunk(record_index, i as u32, chunk).unwrap();
                    prop_assert!(completed_in([status]).is_none());
                }
                reassembler.complete(record_index).unwrap().map(|r| r.data)
            }
            Arrival::ChunksFirst => {
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let status = reassembler.chunk(record_index, i as u32, chunk).unwrap();
                    prop_assert_eq!(status, ChunkStatus::Buffered);
                }
                let statuses = reassembler.start(record_index, card_id, total, size).unwrap();
                prop_assert_eq!(statuses.len() as u32, total);
                reassembler.complete(record_index).unwrap().map(|r| r.data)
            }
            Arrival::CompleteEarly => {
                reassembler.start(record_index, card_id, total, size).unwrap();
                let mut chunks = chunks;
                let last = chunks.pop();
                for (i, chunk) in chunks.into_iter().enumerate() {
                    reassembler.chunk(record_index, i as u32, chunk).unwrap();
                }
                match last {
                    // Nothing left to wait for
                    None => reassembler.complete(record_index).unwrap().map(|r| r.data),
                    Some(last) => {
                        prop_assert!(reassembler.complete(record_index).unwrap().is_none());
                        let status = reassembler.chunk(record_index, total - 1, last).unwrap();
                        completed_in([status])
                    }
                }
            }
        };

        prop_assert_eq!(result, Some(data));
        prop_assert_eq!(reassembler.in_flight(), 0);
    }

    /// A skipped chunk is always caught
    #[test]
    fn gaps_are_rejected(
        data in prop::collection::vec(any::<u8>(), 2..4096).prop_map(Bytes::from),
        chunk_size in 1usize..1024,
        skip in any::<prop::sample::Index>(),
    ) {
        let chunks: Vec<Bytes> = split_chunks(&data, chunk_size).collect();
        prop_assume!(chunks.len() >= 2);
        let skipped = skip.index(chunks.len());

        let mut reassembler = Reassembler::new(DEFAULT_CHUNK_SIZE, 0);
        reassembler
            .start(7, CardId::new(), chunks.len() as u32, data.len() as u64)
            .unwrap();

        let last = chunks.len() - 1;
        let mut rejected = false;
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i == skipped {
                continue;
            }
            if reassembler.chunk(7, i as u32, chunk).is_err() {
                rejected = true;
                break;
            }
        }

        if skipped == last {
            // Everything before the gap is fine; the record just never completes
            prop_assert!(!rejected);
            prop_assert!(reassembler.complete(7).unwrap().is_none());
        } else {
            prop_assert!(rejected);
        }
    }

    /// The 8-byte header carries both indices little-endian ahead of the payload
    #[test]
    fn chunk_header_layout(record_index in any::<u32>(), chunk_index in any::<u32>(), payload in prop::collection::vec(any::<u8>(), 0..64)) {
        let frame = ChunkHeader::new(record_index, chunk_index).encode_frame(&payload);

        prop_assert_eq!(&frame[0..4], &record_index.to_le_bytes()[..]);
        prop_assert_eq!(&frame[4..8], &chunk_index.to_le_bytes()[..]);
        let (header, body) = ChunkHeader::decode_frame(frame).unwrap();
        prop_assert_eq!(header, ChunkHeader::new(record_index, chunk_index));
        prop_assert_eq!(&body[..], &payload[..]);
    }

    /// Codes survive relay through wrapping chat clients, and any typo in
    /// the body is refused rather than decoded into a wrong endpoint
    #[test]
    fn handshake_codes_detect_typos(
        node_id in any::<[u8; 32]>(),
        addresses in address_strategy(),
        position in any::<prop::sample::Index>(),
    ) {
        let codec = SignalingCodec::new(600);
        let description = SessionDescription::offer(
            SessionId::new(),
            EndpointInfo::new(node_id).with_addresses(addresses),
        );
        let code = codec.encode(&description).unwrap();
        let code = code.as_str();

        // Line-wrapped in transit
        let wrapped: String = code
            .as_bytes()
            .chunks(40)
            .map(|line| std::str::from_utf8(line).unwrap())
            .collect::<Vec<_>>()
            .join("\n  ");
        prop_assert_eq!(codec.decode(&wrapped).unwrap(), description);

        // One character changed, away from the prefix and the final
        // partial base64 group
        let body_start = code.find('.').unwrap() + 1;
        let editable = code.len() - body_start - 4;
        let at = body_start + position.index(editable);
        let original = code.as_bytes()[at];
        let replacement = if original == b'A' { b'B' } else { b'A' };
        let mut typo = code.as_bytes().to_vec();
        typo[at] = replacement;
        let typo = String::from_utf8(typo).unwrap();

        let err = codec.decode(&typo).unwrap_err();
        prop_assert!(matches!(err, HandshakeError::MalformedCode(_)), "got {:?}", err);
    }
}
