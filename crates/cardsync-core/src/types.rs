//! Core types for Cardsync

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Current time as unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Unique identifier for a card
///
/// Uses ULID for time-ordered unique identifiers that sort lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(pub Ulid);

impl CardId {
    /// Create a new CardId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for CardId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project-level metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMeta {
    /// Unix ms of creation
    pub created_at: i64,
    /// Unix ms of the last change
    pub updated_at: i64,
}

impl ProjectMeta {
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at` to now
    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

impl Default for ProjectMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A single card in the project: a voice memo plus its annotations.
///
/// The audio itself is stored separately and never travels inside a card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: CardId,
    pub label: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Audio duration in seconds
    #[serde(default)]
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waveform_data: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Position in the project
    pub order: u32,
}

impl Card {
    /// Create a new card with the given label at the given position
    pub fn new(label: impl Into<String>, order: u32) -> Self {
        let now = now_millis();
        Self {
            id: CardId::new(),
            label: label.into(),
            notes: String::new(),
            tags: Vec::new(),
            color: None,
            duration: 0.0,
            waveform_data: None,
            transcript: None,
            created_at: now,
            updated_at: now,
            order,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// Apply a partial update, bumping `updated_at`
    pub fn apply_changes(&mut self, changes: &CardChanges) {
        if let Some(label) = &changes.label {
            self.label = label.clone();
        }
        if let Some(notes) = &changes.notes {
            self.notes = notes.clone();
        }
        if let Some(tags) = &changes.tags {
            self.tags = tags.clone();
        }
        if let Some(color) = &changes.color {
            self.color = Some(color.clone());
        }
        self.updated_at = now_millis();
    }

    /// Apply derived audio metadata, bumping `updated_at`
    pub fn apply_audio_meta(&mut self, meta: &AudioMeta) {
        self.duration = meta.duration;
        self.waveform_data = meta.waveform_data.clone();
        self.transcript = meta.transcript.clone();
        self.updated_at = now_millis();
    }
}

/// Card metadata plus the size of its audio blob.
///
/// This is what travels in a `sync_request` manifest and an `op_card_create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardManifest {
    #[serde(flatten)]
    pub card: Card,
    pub audio_size: u64,
}

/// Partial update of a card's user-editable fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl CardChanges {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.notes.is_none() && self.tags.is_none() && self.color.is_none()
    }
}

/// New position for a single card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardOrder {
    pub id: CardId,
    pub order: u32,
}

/// Metadata derived from a card's audio
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMeta {
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waveform_data: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

/// Complete project contents, the unit of atomic replacement
#[derive(Debug, Clone, Default)]
pub struct ProjectSnapshot {
    pub project: ProjectMeta,
    pub cards: Vec<Card>,
    /// Audio blobs keyed by card; cards without audio have no entry
    pub audio: Vec<(CardId, Bytes)>,
}

impl ProjectSnapshot {
    /// Total audio bytes in the snapshot
    pub fn total_audio_bytes(&self) -> u64 {
        self.audio.iter().map(|(_, b)| b.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_serializes_camel_case() {
        let card = Card::new("Intro", 0).with_duration(1.5);
        let json = serde_json::to_value(&card).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("waveformData").is_none());
        assert_eq!(json["id"], serde_json::Value::String(card.id.to_string()));
    }

    #[test]
    fn test_manifest_flattens_card() {
        let card = Card::new("Verse", 1);
        let manifest = CardManifest {
            card: card.clone(),
            audio_size: 8192,
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["audioSize"], 8192);
        assert_eq!(json["label"], "Verse");

        let back: CardManifest = serde_json::from_value(json).unwrap();
        assert_eq!(back.card, card);
    }

    #[test]
    fn test_apply_changes_only_touches_given_fields() {
        let mut card = Card::new("Old", 0).with_notes("keep me");
        card.apply_changes(&CardChanges {
            label: Some("New".into()),
            color: Some("#ff0000".into()),
            ..Default::default()
        });
        assert_eq!(card.label, "New");
        assert_eq!(card.notes, "keep me");
        assert_eq!(card.color.as_deref(), Some("#ff0000"));
    }

    #[test]
    fn test_card_id_string_roundtrip() {
        let id = CardId::new();
        assert_eq!(CardId::from_string(&id.to_string()).unwrap(), id);
        assert!(CardId::from_string("not-a-ulid").is_err());
    }
}
