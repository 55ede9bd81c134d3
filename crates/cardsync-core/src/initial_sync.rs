//! One-time full project handoff.
//!
//! Writer:
//! ```text
//! idle ─begin()─► awaiting_accept ─sync_accept─► streaming ─finished─► complete
//!                       └──sync_reject──► idle
//! ```
//!
//! Reader:
//! ```text
//! idle ─sync_request─► awaiting_decision ─accept()─► receiving ─sync_complete─► committed
//!                             └──reject()──► idle (store untouched)
//! ```
//!
//! For every manifest entry the writer sends `chunk_start`, the chunks and
//! `chunk_complete`, even for empty audio, then a final `sync_complete`.
//! The reader stages records in memory and replaces the whole project only
//! when `sync_complete` checks out, so a dropped connection never leaves it
//! half-replaced. The binary channel is a separate stream, so `sync_complete`
//! may overtake the last records' chunks; the commit then waits until the
//! final record is staged.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, SyncError, SyncResult};
use crate::protocol::{chunk_count, ControlMessage};
use crate::reassembly::{ChunkStatus, CompletedRecord, Reassembler};
use crate::types::{CardId, CardManifest, ProjectMeta, ProjectSnapshot};

/// Writer-side progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutgoingSyncState {
    Idle,
    AwaitingAccept,
    Streaming,
    Complete,
}

/// Reader-side progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncomingSyncState {
    Idle,
    AwaitingDecision,
    Receiving,
    Committed,
}

/// Combined view for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialSyncPhase {
    Idle,
    /// We offered our project and wait for the peer
    Offered,
    Sending,
    Sent,
    /// The peer offered its project; waiting for the host
    AwaitingDecision,
    Receiving,
    Received,
}

/// A sync offer waiting for the host's overwrite confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSyncRequest {
    pub card_count: u32,
    pub total_audio_bytes: u64,
}

/// Transfer progress, reported after every chunk and every completed record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub current_record_index: u32,
    pub total_records: u32,
}

/// One blob to stream
#[derive(Debug, Clone)]
pub struct BlobTransfer {
    pub record_index: u32,
    pub card_id: CardId,
    pub data: Bytes,
}

impl BlobTransfer {
    pub fn chunk_start(&self, chunk_size: usize) -> ControlMessage {
        ControlMessage::ChunkStart {
            card_id: self.card_id,
            card_index: self.record_index,
            total_chunks: chunk_count(self.data.len() as u64, chunk_size),
            audio_size: self.data.len() as u64,
        }
    }

    pub fn chunk_complete(&self) -> ControlMessage {
        ControlMessage::ChunkComplete {
            card_id: self.card_id,
            card_index: self.record_index,
        }
    }
}

/// What the streamer should send
#[derive(Debug, Clone)]
pub struct StreamJob {
    pub kind: StreamKind,
    pub blobs: Vec<BlobTransfer>,
    /// Sent after the last blob
    pub trailer: Option<ControlMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    InitialSync,
    LiveAudio,
}

impl StreamJob {
    pub fn total_bytes(&self) -> u64 {
        self.blobs.iter().map(|b| b.data.len() as u64).sum()
    }
}

/// Writer side of the initial sync
#[derive(Debug)]
pub struct OutgoingSync {
    state: OutgoingSyncState,
    snapshot: Option<ProjectSnapshot>,
}

impl Default for OutgoingSync {
    fn default() -> Self {
        Self::new()
    }
}

impl OutgoingSync {
    pub fn new() -> Self {
        Self {
            state: OutgoingSyncState::Idle,
            snapshot: None,
        }
    }

    pub fn state(&self) -> OutgoingSyncState {
        self.state
    }

    /// Offer our whole project: returns the `sync_request` to send.
    pub fn begin(&mut self, snapshot: ProjectSnapshot) -> SyncResult<ControlMessage> {
        if matches!(
            self.state,
            OutgoingSyncState::AwaitingAccept | OutgoingSyncState::Streaming
        ) {
            return Err(SyncError::InvalidOperation(
                "an initial sync is already in progress".into(),
            ));
        }

        let cards = snapshot
            .cards
            .iter()
            .map(|card| CardManifest {
                card: card.clone(),
                audio_size: snapshot
                    .audio
                    .iter()
                    .find(|(id, _)| *id == card.id)
                    .map(|(_, blob)| blob.len() as u64)
                    .unwrap_or(0),
            })
            .collect();
        let message = ControlMessage::SyncRequest {
            project: snapshot.project,
            cards,
            total_audio_bytes: snapshot.total_audio_bytes(),
        };

        info!(
            cards = snapshot.cards.len(),
            bytes = snapshot.total_audio_bytes(),
            "Offering project"
        );
        self.snapshot = Some(snapshot);
        self.state = OutgoingSyncState::AwaitingAccept;
        Ok(message)
    }

    /// The peer accepted: build the streaming job.
    pub fn on_accept(&mut self) -> Result<StreamJob, ProtocolError> {
        if self.state != OutgoingSyncState::AwaitingAccept {
            return Err(ProtocolError::UnexpectedMessage {
                message: "sync_accept".into(),
                state: format!("{:?}", self.state),
            });
        }
        let snapshot = self.snapshot.take().unwrap_or_default();
        self.state = OutgoingSyncState::Streaming;

        let blobs: Vec<BlobTransfer> = snapshot
            .cards
            .iter()
            .enumerate()
            .map(|(index, card)| BlobTransfer {
                record_index: index as u32,
                card_id: card.id,
                data: snapshot
                    .audio
                    .iter()
                    .find(|(id, _)| *id == card.id)
                    .map(|(_, blob)| blob.clone())
                    .unwrap_or_default(),
            })
            .collect();
        let total_bytes = blobs.iter().map(|b| b.data.len() as u64).sum();
        let trailer = ControlMessage::SyncComplete {
            total_cards: blobs.len() as u32,
            total_bytes,
        };

        Ok(StreamJob {
            kind: StreamKind::InitialSync,
            blobs,
            trailer: Some(trailer),
        })
    }

    pub fn on_reject(&mut self) -> Result<(), ProtocolError> {
        if self.state != OutgoingSyncState::AwaitingAccept {
            return Err(ProtocolError::UnexpectedMessage {
                message: "sync_reject".into(),
                state: format!("{:?}", self.state),
            });
        }
        self.snapshot = None;
        self.state = OutgoingSyncState::Idle;
        Ok(())
    }

    pub fn on_stream_finished(&mut self) {
        if self.state == OutgoingSyncState::Streaming {
            self.state = OutgoingSyncState::Complete;
        }
    }

    /// The transfer failed or the link went away
    pub fn abort(&mut self) {
        self.snapshot = None;
        self.state = OutgoingSyncState::Idle;
    }
}

/// What handling an inbound sync message produced
#[derive(Debug, Default)]
pub struct IncomingUpdate {
    pub progress: Vec<SyncProgress>,
    /// Set once the staged project is ready to replace the store
    pub commit: Option<ProjectSnapshot>,
}

/// Reader side of the initial sync
#[derive(Debug)]
pub struct IncomingSync {
    state: IncomingSyncState,
    project: Option<ProjectMeta>,
    manifest: Vec<CardManifest>,
    total_audio_bytes: u64,
    staged: Vec<(CardId, Bytes)>,
    completed_records: u32,
    bytes_received: u64,
    /// Totals from a `sync_complete` that arrived ahead of the last records
    finish_pending: Option<(u32, u64)>,
    reassembler: Reassembler,
}

impl IncomingSync {
    pub fn new(max_chunk_size: usize, max_early_bytes: usize) -> Self {
        Self {
            state: IncomingSyncState::Idle,
            project: None,
            manifest: Vec::new(),
            total_audio_bytes: 0,
            staged: Vec::new(),
            completed_records: 0,
            bytes_received: 0,
            finish_pending: None,
            reassembler: Reassembler::new(max_chunk_size, max_early_bytes),
        }
    }

    pub fn state(&self) -> IncomingSyncState {
        self.state
    }

    fn unexpected(&self, message: &str) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            message: message.to_string(),
            state: format!("{:?}", self.state),
        }
    }

    fn total_records(&self) -> u32 {
        self.manifest.len() as u32
    }

    fn progress(&self, current_record_index: u32) -> SyncProgress {
        SyncProgress {
            bytes_transferred: self.bytes_received,
            bytes_total: self.total_audio_bytes,
            current_record_index,
            total_records: self.total_records(),
        }
    }

    /// A `sync_request` arrived. Returns what the host must confirm.
    pub fn on_request(
        &mut self,
        project: ProjectMeta,
        cards: Vec<CardManifest>,
        total_audio_bytes: u64,
    ) -> Result<PendingSyncRequest, ProtocolError> {
        if matches!(
            self.state,
            IncomingSyncState::AwaitingDecision | IncomingSyncState::Receiving
        ) {
            return Err(self.unexpected("sync_request"));
        }
        let declared = cards
            .iter()
            .try_fold(0u64, |sum, c| sum.checked_add(c.audio_size))
            .ok_or_else(|| ProtocolError::SizeMismatch {
                what: "manifest audio total".into(),
                expected: total_audio_bytes,
                actual: u64::MAX,
            })?;
        if declared != total_audio_bytes {
            return Err(ProtocolError::SizeMismatch {
                what: "manifest audio total".into(),
                expected: total_audio_bytes,
                actual: declared,
            });
        }

        self.reset();
        self.project = Some(project);
        self.manifest = cards;
        self.total_audio_bytes = total_audio_bytes;
        self.state = IncomingSyncState::AwaitingDecision;
        Ok(PendingSyncRequest {
            card_count: self.total_records(),
            total_audio_bytes,
        })
    }

    /// Host confirmed the overwrite
    pub fn accept(&mut self) -> SyncResult<ControlMessage> {
        if self.state != IncomingSyncState::AwaitingDecision {
            return Err(SyncError::InvalidOperation(
                "no sync request awaiting a decision".into(),
            ));
        }
        self.state = IncomingSyncState::Receiving;
        Ok(ControlMessage::SyncAccept { reason: None })
    }

    /// Host declined; nothing local changes
    pub fn reject(&mut self, reason: Option<String>) -> SyncResult<ControlMessage> {
        if self.state != IncomingSyncState::AwaitingDecision {
            return Err(SyncError::InvalidOperation(
                "no sync request awaiting a decision".into(),
            ));
        }
        self.reset();
        Ok(ControlMessage::SyncReject { reason })
    }

    fn stage(&mut self, record: CompletedRecord) -> Result<(), ProtocolError> {
        let entry = self
            .manifest
            .get(record.record_index as usize)
            .ok_or_else(|| ProtocolError::UnknownRecord(format!("record {}", record.record_index)))?;
        if entry.card.id != record.card_id {
            return Err(ProtocolError::UnknownRecord(record.card_id.to_string()));
        }
        if entry.audio_size != record.data.len() as u64 {
            return Err(ProtocolError::SizeMismatch {
                what: format!("audio of {}", record.card_id),
                expected: entry.audio_size,
                actual: record.data.len() as u64,
            });
        }
        debug!(
            record_index = record.record_index,
            bytes = record.data.len(),
            "Record staged"
        );
        if !record.data.is_empty() {
            self.staged.push((record.card_id, record.data));
        }
        self.completed_records += 1;
        Ok(())
    }

    fn absorb(&mut self, status: ChunkStatus, update: &mut IncomingUpdate) -> Result<(), ProtocolError> {
        if let ChunkStatus::Accepted {
            record_index,
            len,
            completed,
        } = status
        {
            self.bytes_received += len as u64;
            update.progress.push(self.progress(record_index));
            if let Some(record) = completed {
                self.stage(record)?;
                update.progress.push(self.progress(record_index));
                self.finish_if_ready(update)?;
            }
        }
        Ok(())
    }

    pub fn on_chunk_start(
        &mut self,
        card_id: CardId,
        record_index: u32,
        total_chunks: u32,
        size: u64,
    ) -> Result<IncomingUpdate, ProtocolError> {
        if self.state != IncomingSyncState::Receiving {
            return Err(self.unexpected("chunk_start"));
        }
        let entry = self
            .manifest
            .get(record_index as usize)
            .ok_or_else(|| ProtocolError::UnknownRecord(format!("record {}", record_index)))?;
        if entry.card.id != card_id {
            return Err(ProtocolError::UnknownRecord(card_id.to_string()));
        }
        if entry.audio_size != size {
            return Err(ProtocolError::SizeMismatch {
                what: format!("audio of {}", card_id),
                expected: entry.audio_size,
                actual: size,
            });
        }

        let mut update = IncomingUpdate::default();
        for status in self
            .reassembler
            .start(record_index, card_id, total_chunks, size)?
        {
            self.absorb(status, &mut update)?;
        }
        Ok(update)
    }

    pub fn on_chunk(
        &mut self,
        record_index: u32,
        chunk_index: u32,
        payload: Bytes,
    ) -> Result<IncomingUpdate, ProtocolError> {
        if self.state != IncomingSyncState::Receiving {
            return Err(self.unexpected("binary chunk"));
        }
        let mut update = IncomingUpdate::default();
        let status = self.reassembler.chunk(record_index, chunk_index, payload)?;
        self.absorb(status, &mut update)?;
        Ok(update)
    }

    pub fn on_chunk_complete(&mut self, record_index: u32) -> Result<IncomingUpdate, ProtocolError> {
        if self.state != IncomingSyncState::Receiving {
            return Err(self.unexpected("chunk_complete"));
        }
        let mut update = IncomingUpdate::default();
        if let Some(record) = self.reassembler.complete(record_index)? {
            self.stage(record)?;
            update.progress.push(self.progress(record_index));
            self.finish_if_ready(&mut update)?;
        }
        Ok(update)
    }

    /// `sync_complete` arrived. Totals are checked against the manifest at
    /// once; the commit is handed back as soon as every record is staged,
    /// which may be on a later chunk.
    pub fn on_sync_complete(
        &mut self,
        total_cards: u32,
        total_bytes: u64,
    ) -> Result<IncomingUpdate, ProtocolError> {
        if self.state != IncomingSyncState::Receiving || self.finish_pending.is_some() {
            return Err(self.unexpected("sync_complete"));
        }
        if total_cards != self.total_records() {
            return Err(ProtocolError::SizeMismatch {
                what: "record count".into(),
                expected: self.total_records() as u64,
                actual: total_cards as u64,
            });
        }
        if total_bytes != self.total_audio_bytes {
            return Err(ProtocolError::SizeMismatch {
                what: "audio bytes".into(),
                expected: self.total_audio_bytes,
                actual: total_bytes,
            });
        }

        self.finish_pending = Some((total_cards, total_bytes));
        let mut update = IncomingUpdate::default();
        self.finish_if_ready(&mut update)?;
        if update.commit.is_none() {
            debug!(
                staged = self.completed_records,
                total = total_cards,
                "Sync complete ahead of the last records"
            );
        }
        Ok(update)
    }

    fn finish_if_ready(&mut self, update: &mut IncomingUpdate) -> Result<(), ProtocolError> {
        let Some((total_cards, total_bytes)) = self.finish_pending else {
            return Ok(());
        };
        if self.completed_records < total_cards {
            return Ok(());
        }
        if self.bytes_received != total_bytes {
            return Err(ProtocolError::SizeMismatch {
                what: "audio bytes".into(),
                expected: total_bytes,
                actual: self.bytes_received,
            });
        }

        let snapshot = ProjectSnapshot {
            project: self.project.take().unwrap_or_default(),
            cards: std::mem::take(&mut self.manifest)
                .into_iter()
                .map(|m| m.card)
                .collect(),
            audio: std::mem::take(&mut self.staged),
        };
        info!(
            cards = snapshot.cards.len(),
            bytes = total_bytes,
            "Initial sync received"
        );
        self.reassembler.clear();
        self.finish_pending = None;
        self.state = IncomingSyncState::Committed;
        update.commit = Some(snapshot);
        Ok(())
    }

    /// Drop all staged data; the local project stays as it was.
    pub fn abort(&mut self) {
        if self.state == IncomingSyncState::Receiving {
            warn!(
                staged = self.staged.len(),
                "Discarding partially received project"
            );
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = IncomingSyncState::Idle;
        self.project = None;
        self.manifest.clear();
        self.total_audio_bytes = 0;
        self.staged.clear();
        self.completed_records = 0;
        self.bytes_received = 0;
        self.finish_pending = None;
        self.reassembler.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChunkHeader;
    use crate::reassembly::split_chunks;
    use crate::types::Card;

    const CHUNK: usize = 16 * 1024;

    fn snapshot(sizes: &[usize]) -> ProjectSnapshot {
        let mut snapshot = ProjectSnapshot::default();
        for (i, size) in sizes.iter().enumerate() {
            let card = Card::new(format!("card {}", i), i as u32);
            if *size > 0 {
                snapshot
                    .audio
                    .push((card.id, Bytes::from(vec![i as u8; *size])));
            }
            snapshot.cards.push(card);
        }
        snapshot
    }

    /// Play a stream job into the receiver the way the wire would
    fn deliver(job: &StreamJob, incoming: &mut IncomingSync) -> (Vec<SyncProgress>, Option<ProjectSnapshot>) {
        let mut progress = Vec::new();
        for blob in &job.blobs {
            match blob.chunk_start(CHUNK) {
                ControlMessage::ChunkStart {
                    card_id,
                    card_index,
                    total_chunks,
                    audio_size,
                } => progress.extend(
                    incoming
                        .on_chunk_start(card_id, card_index, total_chunks, audio_size)
                        .unwrap()
                        .progress,
                ),
                other => panic!("unexpected {:?}", other),
            }
            for (i, chunk) in split_chunks(&blob.data, CHUNK).enumerate() {
                let frame = ChunkHeader::new(blob.record_index, i as u32).encode_frame(&chunk);
                let (header, payload) = ChunkHeader::decode_frame(frame).unwrap();
                progress.extend(
                    incoming
                        .on_chunk(header.record_index, header.chunk_index, payload)
                        .unwrap()
                        .progress,
                );
            }
            progress.extend(
                incoming
                    .on_chunk_complete(blob.record_index)
                    .unwrap()
                    .progress,
            );
        }
        let commit = match job.trailer.clone() {
            Some(ControlMessage::SyncComplete {
                total_cards,
                total_bytes,
            }) => incoming
                .on_sync_complete(total_cards, total_bytes)
                .unwrap()
                .commit,
            other => panic!("unexpected trailer {:?}", other),
        };
        (progress, commit)
    }

    fn request_parts(message: ControlMessage) -> (ProjectMeta, Vec<CardManifest>, u64) {
        match message {
            ControlMessage::SyncRequest {
                project,
                cards,
                total_audio_bytes,
            } => (project, cards, total_audio_bytes),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_full_transfer_of_three_records() {
        let source = snapshot(&[0, 8 * 1024, 20 * 1024]);
        let mut outgoing = OutgoingSync::new();
        let mut incoming = IncomingSync::new(CHUNK, 1 << 20);

        let (project, cards, total) = request_parts(outgoing.begin(source.clone()).unwrap());
        assert_eq!(total, 28 * 1024);
        let pending = incoming.on_request(project, cards, total).unwrap();
        assert_eq!(pending.card_count, 3);
        assert_eq!(incoming.accept().unwrap(), ControlMessage::SyncAccept { reason: None });

        let job = outgoing.on_accept().unwrap();
        assert_eq!(outgoing.state(), OutgoingSyncState::Streaming);
        let (progress, commit) = deliver(&job, &mut incoming);

        let indices: Vec<u32> = progress.iter().map(|p| p.current_record_index).collect();
        for index in 0..3 {
            assert!(indices.contains(&index));
        }
        let last = progress.last().unwrap();
        assert_eq!(last.bytes_transferred, last.bytes_total);
        assert_eq!(last.total_records, 3);

        let commit = commit.unwrap();
        assert_eq!(commit.cards, source.cards);
        assert_eq!(commit.total_audio_bytes(), 28 * 1024);
        assert_eq!(incoming.state(), IncomingSyncState::Committed);
    }

    #[test]
    fn test_reject_returns_to_idle() {
        let mut outgoing = OutgoingSync::new();
        let mut incoming = IncomingSync::new(CHUNK, 1 << 20);
        let (project, cards, total) = request_parts(outgoing.begin(snapshot(&[10])).unwrap());
        incoming.on_request(project, cards, total).unwrap();

        let reply = incoming.reject(Some("keep mine".into())).unwrap();
        assert!(matches!(reply, ControlMessage::SyncReject { .. }));
        assert_eq!(incoming.state(), IncomingSyncState::Idle);

        outgoing.on_reject().unwrap();
        assert_eq!(outgoing.state(), OutgoingSyncState::Idle);
    }

    #[test]
    fn test_wrong_totals_fail_verification() {
        let mut outgoing = OutgoingSync::new();
        let mut incoming = IncomingSync::new(CHUNK, 1 << 20);
        let (project, cards, total) = request_parts(outgoing.begin(snapshot(&[0, 0])).unwrap());
        incoming.on_request(project, cards, total).unwrap();
        incoming.accept().unwrap();

        let err = incoming.on_sync_complete(3, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeMismatch { .. }));
        let err = incoming.on_sync_complete(2, 99).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeMismatch { .. }));
    }

    #[test]
    fn test_sync_complete_overtaking_chunks_commits_later() {
        let source = snapshot(&[0, 8 * 1024, 20 * 1024]);
        let mut outgoing = OutgoingSync::new();
        let mut incoming = IncomingSync::new(CHUNK, 1 << 20);
        let (project, cards, total) = request_parts(outgoing.begin(source.clone()).unwrap());
        incoming.on_request(project, cards, total).unwrap();
        incoming.accept().unwrap();
        let job = outgoing.on_accept().unwrap();

        // The control channel delivers everything first
        for blob in &job.blobs {
            if let ControlMessage::ChunkStart {
                card_id,
                card_index,
                total_chunks,
                audio_size,
            } = blob.chunk_start(CHUNK)
            {
                incoming
                    .on_chunk_start(card_id, card_index, total_chunks, audio_size)
                    .unwrap();
            }
            incoming.on_chunk_complete(blob.record_index).unwrap();
        }
        let early = incoming.on_sync_complete(3, 28 * 1024).unwrap();
        assert!(early.commit.is_none());
        assert_eq!(incoming.state(), IncomingSyncState::Receiving);

        // Then the binary channel catches up
        let mut commit = None;
        for blob in &job.blobs {
            for (i, chunk) in split_chunks(&blob.data, CHUNK).enumerate() {
                let update = incoming.on_chunk(blob.record_index, i as u32, chunk).unwrap();
                if update.commit.is_some() {
                    assert!(commit.is_none());
                    commit = update.commit;
                }
            }
        }

        let commit = commit.expect("last chunk commits the project");
        assert_eq!(commit.cards, source.cards);
        assert_eq!(commit.total_audio_bytes(), 28 * 1024);
        assert_eq!(incoming.state(), IncomingSyncState::Committed);
    }

    #[test]
    fn test_chunk_start_size_must_match_manifest() {
        let mut outgoing = OutgoingSync::new();
        let mut incoming = IncomingSync::new(CHUNK, 1 << 20);
        let (project, cards, total) = request_parts(outgoing.begin(snapshot(&[10])).unwrap());
        let card_id = cards[0].card.id;
        incoming.on_request(project, cards, total).unwrap();
        incoming.accept().unwrap();

        let err = incoming
            .on_chunk_start(card_id, 0, u32::MAX, u32::MAX as u64 * CHUNK as u64)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SizeMismatch { .. }));
        assert_eq!(incoming.state(), IncomingSyncState::Receiving);
    }

    #[test]
    fn test_overflowing_manifest_is_refused() {
        let mut outgoing = OutgoingSync::new();
        let mut incoming = IncomingSync::new(CHUNK, 1 << 20);
        let (project, mut cards, _) = request_parts(outgoing.begin(snapshot(&[1, 1])).unwrap());
        for card in &mut cards {
            card.audio_size = u64::MAX;
        }

        let err = incoming.on_request(project, cards, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeMismatch { .. }));
        assert_eq!(incoming.state(), IncomingSyncState::Idle);
    }

    #[test]
    fn test_chunks_rejected_before_accept() {
        let mut incoming = IncomingSync::new(CHUNK, 1 << 20);
        assert!(incoming.on_chunk(0, 0, Bytes::from_static(b"x")).is_err());
        assert!(incoming.accept().is_err());
    }

    #[test]
    fn test_abort_discards_staging() {
        let source = snapshot(&[5]);
        let mut outgoing = OutgoingSync::new();
        let mut incoming = IncomingSync::new(CHUNK, 1 << 20);
        let (project, cards, total) = request_parts(outgoing.begin(source).unwrap());
        incoming.on_request(project, cards, total).unwrap();
        incoming.accept().unwrap();
        let job = outgoing.on_accept().unwrap();
        let blob = &job.blobs[0];
        incoming
            .on_chunk_start(blob.card_id, 0, 1, blob.data.len() as u64)
            .unwrap();

        incoming.abort();
        assert_eq!(incoming.state(), IncomingSyncState::Idle);
        assert!(incoming.on_chunk_complete(0).is_err());
    }

    #[test]
    fn test_second_offer_while_pending_is_refused() {
        let mut outgoing = OutgoingSync::new();
        outgoing.begin(snapshot(&[1])).unwrap();
        assert!(outgoing.begin(snapshot(&[1])).is_err());
    }
}
