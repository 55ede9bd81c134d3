//! Persistent project store on redb.
//!
//! Tables:
//! - `project`: single `meta` row with the project metadata (JSON)
//! - `cards`: card id → card (JSON)
//! - `audio`: card id → raw audio bytes

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use super::{sort_cards, ProjectStore};
use crate::error::{SyncError, SyncResult};
use crate::types::{Card, CardId, ProjectMeta, ProjectSnapshot};

const PROJECT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("project");
const CARDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("cards");
const AUDIO_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("audio");

const PROJECT_KEY: &str = "meta";

/// Project store backed by a redb database file
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Database>>,
}

impl RedbStore {
    /// Open or create the store at `path`, creating parent directories and
    /// tables as needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let mut project = write_txn.open_table(PROJECT_TABLE)?;
            if project.get(PROJECT_KEY)?.is_none() {
                let data = encode(&ProjectMeta::new())?;
                project.insert(PROJECT_KEY, data.as_slice())?;
            }
            let _ = write_txn.open_table(CARDS_TABLE)?;
            let _ = write_txn.open_table(AUDIO_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

fn encode<T: serde::Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> SyncResult<T> {
    serde_json::from_slice(data).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Remove every row from a table inside an open write transaction
fn clear_table(
    txn: &redb::WriteTransaction,
    def: TableDefinition<&str, &[u8]>,
) -> SyncResult<()> {
    let mut table = txn.open_table(def)?;
    let keys = table
        .iter()?
        .map(|entry| entry.map(|(k, _)| k.value().to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    for key in keys {
        table.remove(key.as_str())?;
    }
    Ok(())
}

impl ProjectStore for RedbStore {
    fn project(&self) -> SyncResult<ProjectMeta> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PROJECT_TABLE)?;
        match table.get(PROJECT_KEY)? {
            Some(v) => decode(v.value()),
            None => Ok(ProjectMeta::new()),
        }
    }

    fn put_project(&self, project: &ProjectMeta) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PROJECT_TABLE)?;
            let data = encode(project)?;
            table.insert(PROJECT_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list_cards(&self) -> SyncResult<Vec<Card>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CARDS_TABLE)?;

        let mut cards = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            cards.push(decode::<Card>(value.value())?);
        }
        sort_cards(&mut cards);
        Ok(cards)
    }

    fn get_card(&self, id: &CardId) -> SyncResult<Option<Card>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CARDS_TABLE)?;
        let key = id.to_string();

        match table.get(key.as_str())? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    fn put_card(&self, card: &Card) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CARDS_TABLE)?;
            let data = encode(card)?;
            let key = card.id.to_string();
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_card(&self, id: &CardId) -> SyncResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let existed = {
            let key = id.to_string();
            let mut cards = write_txn.open_table(CARDS_TABLE)?;
            let mut audio = write_txn.open_table(AUDIO_TABLE)?;
            audio.remove(key.as_str())?;
            let removed = cards.remove(key.as_str())?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn get_audio(&self, id: &CardId) -> SyncResult<Option<Bytes>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(AUDIO_TABLE)?;
        let key = id.to_string();

        Ok(table
            .get(key.as_str())?
            .map(|v| Bytes::copy_from_slice(v.value())))
    }

    fn put_audio(&self, id: &CardId, audio: Bytes) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUDIO_TABLE)?;
            let key = id.to_string();
            table.insert(key.as_str(), audio.as_ref())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn replace_all(&self, snapshot: ProjectSnapshot) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        clear_table(&write_txn, CARDS_TABLE)?;
        clear_table(&write_txn, AUDIO_TABLE)?;
        {
            let mut project = write_txn.open_table(PROJECT_TABLE)?;
            let data = encode(&snapshot.project)?;
            project.insert(PROJECT_KEY, data.as_slice())?;

            let mut cards = write_txn.open_table(CARDS_TABLE)?;
            for card in &snapshot.cards {
                let data = encode(card)?;
                let key = card.id.to_string();
                cards.insert(key.as_str(), data.as_slice())?;
            }

            let mut audio = write_txn.open_table(AUDIO_TABLE)?;
            for (id, blob) in &snapshot.audio {
                let key = id.to_string();
                audio.insert(key.as_str(), blob.as_ref())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
