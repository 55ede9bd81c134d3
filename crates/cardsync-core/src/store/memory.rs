//! In-memory project store

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use super::{sort_cards, ProjectStore};
use crate::error::SyncResult;
use crate::types::{Card, CardId, ProjectMeta, ProjectSnapshot};

#[derive(Debug, Default)]
struct Inner {
    project: ProjectMeta,
    cards: HashMap<CardId, Card>,
    audio: HashMap<CardId, Bytes>,
}

/// Project store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with the given snapshot
    pub fn with_snapshot(snapshot: ProjectSnapshot) -> Self {
        let store = Self::new();
        store.load(snapshot);
        store
    }

    fn load(&self, snapshot: ProjectSnapshot) {
        let mut inner = self.inner.write();
        inner.project = snapshot.project;
        inner.cards = snapshot.cards.into_iter().map(|c| (c.id, c)).collect();
        inner.audio = snapshot.audio.into_iter().collect();
    }

    pub fn card_count(&self) -> usize {
        self.inner.read().cards.len()
    }
}

impl ProjectStore for MemoryStore {
    fn project(&self) -> SyncResult<ProjectMeta> {
        Ok(self.inner.read().project)
    }

    fn put_project(&self, project: &ProjectMeta) -> SyncResult<()> {
        self.inner.write().project = *project;
        Ok(())
    }

    fn list_cards(&self) -> SyncResult<Vec<Card>> {
        let mut cards: Vec<Card> = self.inner.read().cards.values().cloned().collect();
        sort_cards(&mut cards);
        Ok(cards)
    }

    fn get_card(&self, id: &CardId) -> SyncResult<Option<Card>> {
        Ok(self.inner.read().cards.get(id).cloned())
    }

    fn put_card(&self, card: &Card) -> SyncResult<()> {
        self.inner.write().cards.insert(card.id, card.clone());
        Ok(())
    }

    fn delete_card(&self, id: &CardId) -> SyncResult<bool> {
        let mut inner = self.inner.write();
        inner.audio.remove(id);
        Ok(inner.cards.remove(id).is_some())
    }

    fn get_audio(&self, id: &CardId) -> SyncResult<Option<Bytes>> {
        Ok(self.inner.read().audio.get(id).cloned())
    }

    fn put_audio(&self, id: &CardId, audio: Bytes) -> SyncResult<()> {
        self.inner.write().audio.insert(*id, audio);
        Ok(())
    }

    fn replace_all(&self, snapshot: ProjectSnapshot) -> SyncResult<()> {
        self.load(snapshot);
        Ok(())
    }
}
