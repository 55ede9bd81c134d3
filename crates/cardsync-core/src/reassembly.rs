//! Reassembly of chunked blobs from the binary channel.
//!
//! Each channel is ordered, but the two channels are independent streams,
//! so a record's first chunks can arrive before its `chunk_start` and a
//! `chunk_complete` can overtake the last chunk. Early chunks wait in a
//! bounded buffer; an early completion is remembered and fires once the
//! final chunk lands.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::types::CardId;

/// A fully received blob
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRecord {
    pub record_index: u32,
    pub card_id: CardId,
    pub data: Bytes,
}

/// Result of feeding one chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkStatus {
    /// Held until its `chunk_start` arrives
    Buffered,
    /// Appended to its record
    Accepted {
        record_index: u32,
        len: usize,
        /// Set when this chunk finished a record whose completion was
        /// already announced
        completed: Option<CompletedRecord>,
    },
}

#[derive(Debug)]
struct Assembly {
    card_id: CardId,
    total_chunks: u32,
    size: u64,
    buf: BytesMut,
    next_chunk: u32,
    complete_announced: bool,
}

impl Assembly {
    fn is_full(&self) -> bool {
        self.next_chunk == self.total_chunks
    }
}

/// Chunks' worth of buffer reserved up front; the rest grows as data
/// actually arrives, since `chunk_start` sizes come from the peer
const PREALLOCATED_CHUNKS: u64 = 4;

#[derive(Debug)]
pub struct Reassembler {
    chunk_size: usize,
    max_early_bytes: usize,
    records: HashMap<u32, Assembly>,
    early: HashMap<u32, Vec<(u32, Bytes)>>,
    early_bytes: usize,
}

impl Reassembler {
    pub fn new(max_chunk_size: usize, max_early_bytes: usize) -> Self {
        Self {
            chunk_size: max_chunk_size,
            max_early_bytes,
            records: HashMap::new(),
            early: HashMap::new(),
            early_bytes: 0,
        }
    }

    /// Records started but not yet completed
    pub fn in_flight(&self) -> usize {
        self.records.len()
    }

    /// Drop every partial record
    pub fn clear(&mut self) {
        self.records.clear();
        self.early.clear();
        self.early_bytes = 0;
    }

    fn take_early(&mut self, record_index: u32) -> Vec<(u32, Bytes)> {
        let chunks = self.early.remove(&record_index).unwrap_or_default();
        self.early_bytes -= chunks.iter().map(|(_, c)| c.len()).sum::<usize>();
        chunks
    }

    /// Begin a record announced by `chunk_start`.
    ///
    /// Returns the statuses of any chunks that arrived ahead of it.
    pub fn start(
        &mut self,
        record_index: u32,
        card_id: CardId,
        total_chunks: u32,
        size: u64,
    ) -> Result<Vec<ChunkStatus>, ProtocolError> {
        // Senders may chunk finer than we would, but never coarser, and
        // every chunk carries at least one byte.
        let capacity = total_chunks as u64 * self.chunk_size as u64;
        if (total_chunks == 0) != (size == 0) || size > capacity || size < total_chunks as u64 {
            self.take_early(record_index);
            return Err(ProtocolError::SizeMismatch {
                what: format!("record {} chunk count", record_index),
                expected: size.div_ceil(self.chunk_size as u64),
                actual: total_chunks as u64,
            });
        }

        trace!(record_index, total_chunks, size, "Record started");
        let reserve = size.min(self.chunk_size as u64 * PREALLOCATED_CHUNKS) as usize;
        self.records.insert(
            record_index,
            Assembly {
                card_id,
                total_chunks,
                size,
                buf: BytesMut::with_capacity(reserve),
                next_chunk: 0,
                complete_announced: false,
            },
        );

        let mut statuses = Vec::new();
        for (chunk_index, payload) in self.take_early(record_index) {
            statuses.push(self.chunk(record_index, chunk_index, payload)?);
        }
        Ok(statuses)
    }

    /// Feed one chunk
    pub fn chunk(
        &mut self,
        record_index: u32,
        chunk_index: u32,
        payload: Bytes,
    ) -> Result<ChunkStatus, ProtocolError> {
        let Some(assembly) = self.records.get_mut(&record_index) else {
            if self.early_bytes + payload.len() > self.max_early_bytes {
                return Err(ProtocolError::UnknownRecord(format!(
                    "record {} (no chunk_start and early buffer full)",
                    record_index
                )));
            }
            self.early_bytes += payload.len();
            self.early
                .entry(record_index)
                .or_default()
                .push((chunk_index, payload));
            return Ok(ChunkStatus::Buffered);
        };

        if chunk_index != assembly.next_chunk || chunk_index >= assembly.total_chunks {
            let total = assembly.total_chunks;
            self.records.remove(&record_index);
            return Err(ProtocolError::ChunkOutOfRange {
                record_index,
                chunk_index,
                total,
            });
        }

        let len = payload.len();
        if assembly.buf.len() as u64 + len as u64 > assembly.size {
            let expected = assembly.size;
            let actual = assembly.buf.len() as u64 + len as u64;
            self.records.remove(&record_index);
            return Err(ProtocolError::SizeMismatch {
                what: format!("record {}", record_index),
                expected,
                actual,
            });
        }

        assembly.buf.extend_from_slice(&payload);
        assembly.next_chunk += 1;

        let completed = if assembly.complete_announced && assembly.is_full() {
            Some(self.finish(record_index)?)
        } else {
            None
        };
        Ok(ChunkStatus::Accepted {
            record_index,
            len,
            completed,
        })
    }

    /// Handle `chunk_complete`.
    ///
    /// Returns the record if every chunk is in; otherwise completion is
    /// deferred to the final chunk.
    pub fn complete(&mut self, record_index: u32) -> Result<Option<CompletedRecord>, ProtocolError> {
        let assembly = self
            .records
            .get_mut(&record_index)
            .ok_or_else(|| ProtocolError::UnknownRecord(format!("record {}", record_index)))?;

        if assembly.is_full() {
            return self.finish(record_index).map(Some);
        }
        debug!(
            record_index,
            received = assembly.next_chunk,
            total = assembly.total_chunks,
            "Completion ahead of chunks, deferring"
        );
        assembly.complete_announced = true;
        Ok(None)
    }

    fn finish(&mut self, record_index: u32) -> Result<CompletedRecord, ProtocolError> {
        let assembly = self
            .records
            .remove(&record_index)
            .ok_or_else(|| ProtocolError::UnknownRecord(format!("record {}", record_index)))?;

        if assembly.buf.len() as u64 != assembly.size {
            return Err(ProtocolError::SizeMismatch {
                what: format!("record {}", record_index),
                expected: assembly.size,
                actual: assembly.buf.len() as u64,
            });
        }
        Ok(CompletedRecord {
            record_index,
            card_id: assembly.card_id,
            data: assembly.buf.freeze(),
        })
    }
}

/// Split a blob into chunk payloads of at most `chunk_size` bytes
pub fn split_chunks(data: &Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
    (0..data.len())
        .step_by(chunk_size.max(1))
        .map(move |start| data.slice(start..(start + chunk_size).min(data.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 16 * 1024;

    fn blob(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    fn feed(r: &mut Reassembler, index: u32, data: &Bytes) -> CompletedRecord {
        let card_id = CardId::new();
        let chunks: Vec<_> = split_chunks(data, CHUNK).collect();
        r.start(index, card_id, chunks.len() as u32, data.len() as u64)
            .unwrap();
        for (i, chunk) in chunks.into_iter().enumerate() {
            r.chunk(index, i as u32, chunk).unwrap();
        }
        r.complete(index).unwrap().unwrap()
    }

    #[test]
    fn test_boundary_sizes() {
        let mut r = Reassembler::new(CHUNK, 1 << 20);
        for len in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 20 * 1024, 3 * CHUNK] {
            let data = blob(len);
            let done = feed(&mut r, 0, &data);
            assert_eq!(done.data, data, "size {}", len);
        }
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn test_huge_declared_size_reserves_little() {
        let mut r = Reassembler::new(CHUNK, 1 << 20);
        let size = u32::MAX as u64 * CHUNK as u64;
        r.start(9, CardId::new(), u32::MAX, size).unwrap();
        assert!(r.records[&9].buf.capacity() <= CHUNK * PREALLOCATED_CHUNKS as usize);

        // Data still lands as it arrives
        let status = r.chunk(9, 0, blob(CHUNK)).unwrap();
        assert!(matches!(status, ChunkStatus::Accepted { len, .. } if len == CHUNK));
    }

    #[test]
    fn test_chunks_before_start_are_held() {
        let mut r = Reassembler::new(CHUNK, 1 << 20);
        let data = blob(CHUNK + 10);
        let chunks: Vec<_> = split_chunks(&data, CHUNK).collect();

        assert_eq!(
            r.chunk(4, 0, chunks[0].clone()).unwrap(),
            ChunkStatus::Buffered
        );
        let drained = r.start(4, CardId::new(), 2, data.len() as u64).unwrap();
        assert_eq!(drained.len(), 1);
        r.chunk(4, 1, chunks[1].clone()).unwrap();
        assert_eq!(r.complete(4).unwrap().unwrap().data, data);
    }

    #[test]
    fn test_completion_ahead_of_last_chunk() {
        let mut r = Reassembler::new(CHUNK, 1 << 20);
        let data = blob(100);
        r.start(1, CardId::new(), 1, 100).unwrap();
        assert_eq!(r.complete(1).unwrap(), None);

        match r.chunk(1, 0, data.clone()).unwrap() {
            ChunkStatus::Accepted {
                completed: Some(done),
                ..
            } => assert_eq!(done.data, data),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_chunk_drops_record() {
        let mut r = Reassembler::new(CHUNK, 1 << 20);
        r.start(2, CardId::new(), 1, 10).unwrap();
        let err = r.chunk(2, 1, blob(10)).unwrap_err();
        assert!(matches!(err, ProtocolError::ChunkOutOfRange { total: 1, .. }));
        assert!(matches!(
            r.complete(2),
            Err(ProtocolError::UnknownRecord(_))
        ));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let mut r = Reassembler::new(CHUNK, 1 << 20);
        r.start(0, CardId::new(), 1, 10).unwrap();
        assert!(matches!(
            r.chunk(0, 0, blob(11)),
            Err(ProtocolError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_inconsistent_chunk_count() {
        let mut r = Reassembler::new(CHUNK, 1 << 20);
        assert!(r.start(0, CardId::new(), 1, 0).is_err());
        assert!(r.start(0, CardId::new(), 0, 5).is_err());
        assert!(r.start(0, CardId::new(), 1, CHUNK as u64 + 1).is_err());
        assert!(r.start(0, CardId::new(), 3, 2).is_err());
        // Finer chunking than ours is fine
        assert!(r.start(1, CardId::new(), 4, CHUNK as u64).is_ok());
    }

    #[test]
    fn test_early_buffer_is_bounded() {
        let mut r = Reassembler::new(CHUNK, 100);
        assert_eq!(r.chunk(9, 0, blob(60)).unwrap(), ChunkStatus::Buffered);
        assert!(matches!(
            r.chunk(9, 1, blob(60)),
            Err(ProtocolError::UnknownRecord(_))
        ));
    }

    #[test]
    fn test_unknown_completion() {
        let mut r = Reassembler::new(CHUNK, 100);
        assert!(matches!(
            r.complete(42),
            Err(ProtocolError::UnknownRecord(_))
        ));
    }
}
