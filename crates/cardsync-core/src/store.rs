//! Local project store
//!
//! The sync engine never owns project data. It reads and mutates the host's
//! store through [`ProjectStore`], always from the session's single event
//! loop, so implementations only need interior mutability, not ordering.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`] for tests and ephemeral hosts
//! - [`RedbStore`] for persistent projects on disk

use bytes::Bytes;

use crate::error::SyncResult;
use crate::types::{Card, CardId, ProjectMeta, ProjectSnapshot};

mod memory;
mod persistent;

pub use memory::MemoryStore;
pub use persistent::RedbStore;

/// Record and blob storage for one project
pub trait ProjectStore: Send + Sync + 'static {
    fn project(&self) -> SyncResult<ProjectMeta>;

    fn put_project(&self, project: &ProjectMeta) -> SyncResult<()>;

    /// All cards, ordered by position
    fn list_cards(&self) -> SyncResult<Vec<Card>>;

    fn get_card(&self, id: &CardId) -> SyncResult<Option<Card>>;

    /// Insert or overwrite a card
    fn put_card(&self, card: &Card) -> SyncResult<()>;

    /// Remove a card and its audio. Returns whether the card existed.
    fn delete_card(&self, id: &CardId) -> SyncResult<bool>;

    fn get_audio(&self, id: &CardId) -> SyncResult<Option<Bytes>>;

    fn put_audio(&self, id: &CardId, audio: Bytes) -> SyncResult<()>;

    /// Atomically replace the whole project.
    ///
    /// Readers observe either the previous contents or the new snapshot,
    /// never a mix.
    fn replace_all(&self, snapshot: ProjectSnapshot) -> SyncResult<()>;

    /// Capture the whole project, audio included
    fn snapshot(&self) -> SyncResult<ProjectSnapshot> {
        let project = self.project()?;
        let cards = self.list_cards()?;
        let mut audio = Vec::new();
        for card in &cards {
            if let Some(blob) = self.get_audio(&card.id)? {
                audio.push((card.id, blob));
            }
        }
        Ok(ProjectSnapshot {
            project,
            cards,
            audio,
        })
    }
}

/// Sort cards into project order. Ties break on id so the order is total.
pub(crate) fn sort_cards(cards: &mut [Card]) {
    cards.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
}
