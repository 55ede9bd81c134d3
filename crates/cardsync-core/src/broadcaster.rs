//! Local mutations and their propagation.
//!
//! Every mutation of the project goes through [`OperationBroadcaster`]:
//! it is applied to the store first and then, if this peer may write and
//! is not replaying a remote change, turned into the control message (and
//! blob transfer) the peer needs to mirror it.
//!
//! Remote operations are applied through the same entry points while an
//! [`OriginGuard`] is held. The guard marks the change as remote-origin so
//! nothing is sent back, and it is released on drop, error paths included.
//!
//! Audio travels separately from its metadata. `op_card_create` and
//! `op_card_audio_change` carry only the size and derived fields; the blob
//! follows on the binary channel under a live record index from
//! [`LIVE_RECORD_BASE`] upward.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::error::{ProtocolError, SyncError, SyncResult};
use crate::initial_sync::{BlobTransfer, StreamJob, StreamKind};
use crate::protocol::{ControlMessage, SyncOperation, LIVE_RECORD_BASE};
use crate::reassembly::{ChunkStatus, CompletedRecord, Reassembler};
use crate::store::ProjectStore;
use crate::types::{AudioMeta, Card, CardChanges, CardId, CardOrder};

/// Shared marker for "the store is being changed on the peer's behalf"
#[derive(Debug, Clone, Default)]
pub struct OriginFlag(Arc<AtomicBool>);

impl OriginFlag {
    pub fn is_remote(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Mark everything until the guard drops as remote-origin
    pub fn enter(&self) -> OriginGuard {
        let was_remote = self.0.swap(true, Ordering::SeqCst);
        OriginGuard {
            flag: self.0.clone(),
            restore: was_remote,
        }
    }
}

/// Clears the remote-origin mark on drop
#[must_use = "the remote-origin mark is cleared as soon as the guard drops"]
#[derive(Debug)]
pub struct OriginGuard {
    flag: Arc<AtomicBool>,
    restore: bool,
}

impl Drop for OriginGuard {
    fn drop(&mut self) {
        self.flag.store(self.restore, Ordering::SeqCst);
    }
}

/// What a local mutation needs to send
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub message: ControlMessage,
    /// Audio to stream after the message
    pub blob: Option<StreamJob>,
}

/// Applies mutations to the store and produces their wire form
pub struct OperationBroadcaster {
    store: Arc<dyn ProjectStore>,
    origin: OriginFlag,
    next_live_record: u32,
    incoming: Reassembler,
    /// Audio announced by the peer and not yet received, by card
    expected_audio: HashMap<CardId, u64>,
}

impl std::fmt::Debug for OperationBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationBroadcaster")
            .field("remote", &self.origin.is_remote())
            .field("next_live_record", &self.next_live_record)
            .field("expected_audio", &self.expected_audio.len())
            .finish()
    }
}

impl OperationBroadcaster {
    /// `max_chunk_size` bounds the chunks accepted from the peer.
    pub fn new(store: Arc<dyn ProjectStore>, max_chunk_size: usize, max_early_bytes: usize) -> Self {
        Self {
            store,
            origin: OriginFlag::default(),
            next_live_record: LIVE_RECORD_BASE,
            incoming: Reassembler::new(max_chunk_size, max_early_bytes),
            expected_audio: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    pub fn origin(&self) -> &OriginFlag {
        &self.origin
    }

    /// Forget partial live transfers, e.g. after the link drops
    pub fn reset_incoming(&mut self) {
        self.incoming.clear();
        self.expected_audio.clear();
    }

    fn should_broadcast(&self, can_write: bool) -> bool {
        can_write && !self.origin.is_remote()
    }

    fn live_record_index(&mut self) -> u32 {
        let index = self.next_live_record;
        self.next_live_record = match index.checked_add(1) {
            Some(next) => next,
            None => LIVE_RECORD_BASE,
        };
        index
    }

    fn blob_job(&mut self, card_id: CardId, data: Bytes) -> StreamJob {
        StreamJob {
            kind: StreamKind::LiveAudio,
            blobs: vec![BlobTransfer {
                record_index: self.live_record_index(),
                card_id,
                data,
            }],
            trailer: None,
        }
    }

    fn require_card(&self, id: &CardId) -> SyncResult<Card> {
        match self.store.get_card(id)? {
            Some(card) => Ok(card),
            None if self.origin.is_remote() => {
                Err(ProtocolError::UnknownRecord(id.to_string()).into())
            }
            None => Err(SyncError::CardNotFound(id.to_string())),
        }
    }

    fn touch_project(&self) -> SyncResult<()> {
        let mut project = self.store.project()?;
        project.touch();
        self.store.put_project(&project)
    }

    /// Add a card, optionally with its audio.
    pub fn create_card(
        &mut self,
        card: Card,
        audio: Option<Bytes>,
        can_write: bool,
    ) -> SyncResult<Option<Broadcast>> {
        // A new card with empty audio has no audio, on either peer
        let audio = audio.filter(|a| !a.is_empty());
        self.store.put_card(&card)?;
        let audio_size = audio.as_ref().map(|a| a.len() as u64).unwrap_or(0);
        if let Some(audio) = &audio {
            self.store.put_audio(&card.id, audio.clone())?;
        }
        self.touch_project()?;
        debug!(card_id = %card.id, audio_size, remote = self.origin.is_remote(), "Card created");

        if !self.should_broadcast(can_write) {
            return Ok(None);
        }
        let blob = audio
            .filter(|a| !a.is_empty())
            .map(|a| self.blob_job(card.id, a));
        Ok(Some(Broadcast {
            message: SyncOperation::CreateCard { card, audio_size }.into_message(),
            blob,
        }))
    }

    /// Change a card's editable fields.
    pub fn update_card(
        &mut self,
        card_id: CardId,
        changes: CardChanges,
        can_write: bool,
    ) -> SyncResult<Option<Broadcast>> {
        let mut card = self.require_card(&card_id)?;
        card.apply_changes(&changes);
        self.store.put_card(&card)?;
        self.touch_project()?;
        debug!(%card_id, remote = self.origin.is_remote(), "Card updated");

        if !self.should_broadcast(can_write) {
            return Ok(None);
        }
        Ok(Some(Broadcast {
            message: SyncOperation::UpdateCard { card_id, changes }.into_message(),
            blob: None,
        }))
    }

    /// Remove a card and its audio.
    ///
    /// Deleting a card the peer already removed is a no-op, so duplicate
    /// deliveries are harmless. A local delete of an unknown card is an
    /// error.
    pub fn delete_card(&mut self, card_id: CardId, can_write: bool) -> SyncResult<Option<Broadcast>> {
        let existed = self.store.delete_card(&card_id)?;
        if !existed {
            if self.origin.is_remote() {
                debug!(%card_id, "Delete for unknown card ignored");
                return Ok(None);
            }
            return Err(SyncError::CardNotFound(card_id.to_string()));
        }
        self.expected_audio.remove(&card_id);
        self.touch_project()?;
        debug!(%card_id, remote = self.origin.is_remote(), "Card deleted");

        if !self.should_broadcast(can_write) {
            return Ok(None);
        }
        Ok(Some(Broadcast {
            message: SyncOperation::DeleteCard { card_id }.into_message(),
            blob: None,
        }))
    }

    /// Move cards. Only `{id, order}` pairs travel.
    pub fn reorder(
        &mut self,
        card_order: Vec<CardOrder>,
        can_write: bool,
    ) -> SyncResult<Option<Broadcast>> {
        let mut moved = Vec::with_capacity(card_order.len());
        for entry in &card_order {
            match self.store.get_card(&entry.id)? {
                Some(mut card) => {
                    card.order = entry.order;
                    moved.push(card);
                }
                None if self.origin.is_remote() => {
                    debug!(card_id = %entry.id, "Reorder of unknown card skipped");
                }
                None => return Err(SyncError::CardNotFound(entry.id.to_string())),
            }
        }
        for card in &moved {
            self.store.put_card(card)?;
        }
        self.touch_project()?;
        debug!(count = moved.len(), remote = self.origin.is_remote(), "Cards reordered");

        if !self.should_broadcast(can_write) {
            return Ok(None);
        }
        Ok(Some(Broadcast {
            message: SyncOperation::Reorder { card_order }.into_message(),
            blob: None,
        }))
    }

    /// Replace a card's audio and its derived metadata.
    ///
    /// Remote changes pass `None` for the audio; the blob arrives later on
    /// the binary channel.
    pub fn change_audio(
        &mut self,
        card_id: CardId,
        audio: Option<Bytes>,
        meta: AudioMeta,
        audio_size: u64,
        can_write: bool,
    ) -> SyncResult<Option<Broadcast>> {
        let mut card = self.require_card(&card_id)?;
        card.apply_audio_meta(&meta);
        self.store.put_card(&card)?;
        if let Some(audio) = &audio {
            self.store.put_audio(&card_id, audio.clone())?;
        }
        self.touch_project()?;
        debug!(%card_id, audio_size, remote = self.origin.is_remote(), "Card audio changed");

        if !self.should_broadcast(can_write) {
            return Ok(None);
        }
        let blob = audio
            .filter(|a| !a.is_empty())
            .map(|a| self.blob_job(card_id, a));
        Ok(Some(Broadcast {
            message: SyncOperation::AudioChange {
                card_id,
                meta,
                audio_size,
            }
            .into_message(),
            blob,
        }))
    }

    /// Apply an operation received from the writer.
    ///
    /// Runs under the remote-origin guard, so the mutation entry points
    /// produce nothing to send back.
    pub fn apply_remote(&mut self, op: SyncOperation) -> SyncResult<()> {
        let _guard = self.origin.enter();
        let name = op.name();
        trace!(op = name, "Applying remote operation");

        let echo = match op {
            SyncOperation::CreateCard { card, audio_size } => {
                let card_id = card.id;
                let echo = self.create_card(card, None, true)?;
                if audio_size > 0 {
                    self.expected_audio.insert(card_id, audio_size);
                }
                echo
            }
            SyncOperation::UpdateCard { card_id, changes } => {
                self.update_card(card_id, changes, true)?
            }
            SyncOperation::DeleteCard { card_id } => self.delete_card(card_id, true)?,
            SyncOperation::Reorder { card_order } => self.reorder(card_order, true)?,
            SyncOperation::AudioChange {
                card_id,
                meta,
                audio_size,
            } => {
                let echo = self.change_audio(card_id, None, meta, audio_size, true)?;
                self.expect_audio(card_id, audio_size)?;
                echo
            }
        };
        debug_assert!(echo.is_none(), "remote {} produced a broadcast", name);
        Ok(())
    }

    fn expect_audio(&mut self, card_id: CardId, audio_size: u64) -> SyncResult<()> {
        if audio_size == 0 {
            // Nothing will follow on the binary channel; the old audio is
            // replaced by an empty one, as it was on the writer
            self.store.put_audio(&card_id, Bytes::new())?;
            self.expected_audio.remove(&card_id);
        } else {
            self.expected_audio.insert(card_id, audio_size);
        }
        Ok(())
    }

    /// Live transfer announced by `chunk_start`
    pub fn on_chunk_start(
        &mut self,
        card_id: CardId,
        record_index: u32,
        total_chunks: u32,
        size: u64,
    ) -> SyncResult<()> {
        match self.expected_audio.get(&card_id) {
            Some(expected) if *expected == size => {}
            Some(expected) => {
                return Err(ProtocolError::SizeMismatch {
                    what: format!("audio of {}", card_id),
                    expected: *expected,
                    actual: size,
                }
                .into())
            }
            None => return Err(ProtocolError::UnknownRecord(card_id.to_string()).into()),
        }
        for status in self
            .incoming
            .start(record_index, card_id, total_chunks, size)?
        {
            self.absorb(status)?;
        }
        Ok(())
    }

    pub fn on_chunk(&mut self, record_index: u32, chunk_index: u32, payload: Bytes) -> SyncResult<()> {
        let status = self.incoming.chunk(record_index, chunk_index, payload)?;
        self.absorb(status)
    }

    pub fn on_chunk_complete(&mut self, record_index: u32) -> SyncResult<()> {
        if let Some(record) = self.incoming.complete(record_index)? {
            self.store_audio(record)?;
        }
        Ok(())
    }

    fn absorb(&mut self, status: ChunkStatus) -> SyncResult<()> {
        if let ChunkStatus::Accepted {
            completed: Some(record),
            ..
        } = status
        {
            self.store_audio(record)?;
        }
        Ok(())
    }

    fn store_audio(&mut self, record: CompletedRecord) -> SyncResult<()> {
        let _guard = self.origin.enter();
        self.expected_audio.remove(&record.card_id);
        if self.store.get_card(&record.card_id)?.is_none() {
            // Deleted while its audio was in flight
            debug!(card_id = %record.card_id, "Dropping audio for removed card");
            return Ok(());
        }
        info!(
            card_id = %record.card_id,
            bytes = record.data.len(),
            "Received card audio"
        );
        self.store.put_audio(&record.card_id, record.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChunkHeader;
    use crate::reassembly::split_chunks;
    use crate::store::MemoryStore;

    const CHUNK: usize = 16 * 1024;

    fn broadcaster() -> (OperationBroadcaster, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            OperationBroadcaster::new(store.clone(), CHUNK, 1 << 20),
            store,
        )
    }

    /// Replay a live blob job into the receiving broadcaster
    fn deliver_blob(job: &StreamJob, to: &mut OperationBroadcaster) {
        for blob in &job.blobs {
            let total = crate::protocol::chunk_count(blob.data.len() as u64, CHUNK);
            to.on_chunk_start(blob.card_id, blob.record_index, total, blob.data.len() as u64)
                .unwrap();
            for (i, chunk) in split_chunks(&blob.data, CHUNK).enumerate() {
                let frame = ChunkHeader::new(blob.record_index, i as u32).encode_frame(&chunk);
                let (header, payload) = ChunkHeader::decode_frame(frame).unwrap();
                to.on_chunk(header.record_index, header.chunk_index, payload)
                    .unwrap();
            }
            to.on_chunk_complete(blob.record_index).unwrap();
        }
    }

    #[test]
    fn test_origin_guard_restores_on_drop() {
        let flag = OriginFlag::default();
        {
            let _outer = flag.enter();
            {
                let _inner = flag.enter();
                assert!(flag.is_remote());
            }
            assert!(flag.is_remote());
        }
        assert!(!flag.is_remote());
    }

    #[test]
    fn test_origin_guard_cleared_on_error_path() {
        let (mut b, _) = broadcaster();
        let result = b.apply_remote(SyncOperation::UpdateCard {
            card_id: CardId::new(),
            changes: CardChanges::label("x"),
        });
        assert!(matches!(
            result,
            Err(SyncError::Protocol(ProtocolError::UnknownRecord(_)))
        ));
        assert!(!b.origin().is_remote());
    }

    #[test]
    fn test_local_mutations_broadcast_only_with_role() {
        let (mut b, store) = broadcaster();
        let card = Card::new("Intro", 0);
        let id = card.id;

        assert!(b.create_card(card, None, false).unwrap().is_none());
        assert_eq!(store.card_count(), 1);

        let out = b
            .update_card(id, CardChanges::label("Outro"), true)
            .unwrap()
            .unwrap();
        assert_eq!(out.message.name(), "op_card_update");
        assert_eq!(store.get_card(&id).unwrap().unwrap().label, "Outro");
    }

    #[test]
    fn test_create_with_audio_uses_live_index() {
        let (mut b, _) = broadcaster();
        let card = Card::new("Take 1", 0);
        let out = b
            .create_card(card, Some(Bytes::from(vec![7u8; 20_000])), true)
            .unwrap()
            .unwrap();
        match out.message {
            ControlMessage::OpCardCreate { audio_size, .. } => assert_eq!(audio_size, 20_000),
            other => panic!("unexpected {:?}", other),
        }
        let job = out.blob.unwrap();
        assert_eq!(job.kind, StreamKind::LiveAudio);
        assert_eq!(job.blobs[0].record_index, LIVE_RECORD_BASE);

        let second = b
            .create_card(Card::new("Take 2", 1), Some(Bytes::from_static(b"abc")), true)
            .unwrap()
            .unwrap();
        assert_eq!(second.blob.unwrap().blobs[0].record_index, LIVE_RECORD_BASE + 1);
    }

    #[test]
    fn test_remote_operations_never_echo() {
        let (mut writer, _) = broadcaster();
        let (mut reader, reader_store) = broadcaster();

        let card = Card::new("Verse", 0);
        let id = card.id;
        let audio = Bytes::from(vec![1u8; CHUNK + 1]);

        let mut outgoing = Vec::new();
        outgoing.push(writer.create_card(card, Some(audio.clone()), true).unwrap().unwrap());
        outgoing.push(
            writer
                .update_card(id, CardChanges::label("Chorus"), true)
                .unwrap()
                .unwrap(),
        );
        outgoing.push(
            writer
                .reorder(vec![CardOrder { id, order: 5 }], true)
                .unwrap()
                .unwrap(),
        );
        outgoing.push(
            writer
                .change_audio(
                    id,
                    Some(Bytes::from_static(b"new take")),
                    AudioMeta {
                        duration: 1.25,
                        ..Default::default()
                    },
                    8,
                    true,
                )
                .unwrap()
                .unwrap(),
        );

        for out in &outgoing {
            let op = SyncOperation::from_message(&out.message).unwrap();
            reader.apply_remote(op).unwrap();
            if let Some(job) = &out.blob {
                deliver_blob(job, &mut reader);
            }
            assert!(!reader.origin().is_remote());
        }

        let mirrored = reader_store.get_card(&id).unwrap().unwrap();
        assert_eq!(mirrored.label, "Chorus");
        assert_eq!(mirrored.order, 5);
        assert_eq!(mirrored.duration, 1.25);
        assert_eq!(
            reader_store.get_audio(&id).unwrap().unwrap(),
            Bytes::from_static(b"new take")
        );

        let delete = writer.delete_card(id, true).unwrap().unwrap();
        reader
            .apply_remote(SyncOperation::from_message(&delete.message).unwrap())
            .unwrap();
        assert_eq!(reader_store.card_count(), 0);
    }

    #[test]
    fn test_duplicate_remote_delete_is_noop() {
        let (mut b, store) = broadcaster();
        let card = Card::new("Gone", 0);
        let id = card.id;
        b.create_card(card, None, false).unwrap();

        b.apply_remote(SyncOperation::DeleteCard { card_id: id }).unwrap();
        b.apply_remote(SyncOperation::DeleteCard { card_id: id }).unwrap();
        assert_eq!(store.card_count(), 0);
    }

    #[test]
    fn test_local_delete_of_unknown_card_fails() {
        let (mut b, _) = broadcaster();
        assert!(matches!(
            b.delete_card(CardId::new(), true),
            Err(SyncError::CardNotFound(_))
        ));
    }

    #[test]
    fn test_unannounced_audio_is_rejected() {
        let (mut b, _) = broadcaster();
        let err = b
            .on_chunk_start(CardId::new(), LIVE_RECORD_BASE, 1, 10)
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::UnknownRecord(_))
        ));
    }

    #[test]
    fn test_create_without_audio_matches_on_both_peers() {
        let (mut writer, writer_store) = broadcaster();
        let (mut viewer, viewer_store) = broadcaster();
        let card = Card::new("Silent", 0);
        let id = card.id;

        let sent = writer
            .create_card(card, Some(Bytes::new()), true)
            .unwrap()
            .unwrap();
        assert!(sent.blob.is_none());
        let op = SyncOperation::from_message(&sent.message).unwrap();
        viewer.apply_remote(op).unwrap();

        assert_eq!(writer_store.get_audio(&id).unwrap(), None);
        assert_eq!(viewer_store.get_audio(&id).unwrap(), None);
        assert!(viewer_store.get_card(&id).unwrap().is_some());
    }
}
