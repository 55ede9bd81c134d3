//! Wire protocol
//!
//! ## Control channel
//!
//! One JSON object per frame. Every message carries `type`, `timestamp`
//! (unix ms) and `id` (per-sender, strictly increasing) next to its own
//! fields:
//!
//! ```json
//! {"type":"op_card_delete","cardId":"01HZX...","timestamp":1718000000000,"id":7}
//! ```
//!
//! ## Binary channel
//!
//! ```text
//! ┌──────────────────┬──────────────────┬──────────────────────┐
//! │ record_index u32 │ chunk_index u32  │ payload (≤ 16 KiB)   │
//! │ little-endian    │ little-endian    │                      │
//! └──────────────────┴──────────────────┴──────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{AudioMeta, Card, CardChanges, CardId, CardManifest, CardOrder, ProjectMeta};

/// Size of the binary chunk header
pub const CHUNK_HEADER_LEN: usize = 8;

/// First record index used for live audio transfers, above any initial
/// sync's `0..N` range
pub const LIVE_RECORD_BASE: u32 = 0x8000_0000;

/// Header preceding every binary chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHeader {
    pub record_index: u32,
    pub chunk_index: u32,
}

impl ChunkHeader {
    pub fn new(record_index: u32, chunk_index: u32) -> Self {
        Self {
            record_index,
            chunk_index,
        }
    }

    /// Build a complete binary frame: header followed by `payload`
    pub fn encode_frame(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
        buf.put_u32_le(self.record_index);
        buf.put_u32_le(self.chunk_index);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Split a binary frame into its header and payload
    pub fn decode_frame(frame: Bytes) -> Result<(ChunkHeader, Bytes), ProtocolError> {
        if frame.len() < CHUNK_HEADER_LEN {
            return Err(ProtocolError::MalformedMessage(format!(
                "binary frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        let mut idx = [0u8; 4];
        idx.copy_from_slice(&frame[0..4]);
        let record_index = u32::from_le_bytes(idx);
        idx.copy_from_slice(&frame[4..8]);
        let chunk_index = u32::from_le_bytes(idx);
        Ok((
            ChunkHeader::new(record_index, chunk_index),
            frame.slice(CHUNK_HEADER_LEN..),
        ))
    }
}

/// Number of chunks needed for a blob. An empty blob has none.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size as u64) as u32
}

/// Every message exchanged on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Writer offers its whole project
    SyncRequest {
        project: ProjectMeta,
        cards: Vec<CardManifest>,
        total_audio_bytes: u64,
    },
    SyncAccept {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SyncReject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Announces the chunks of one record's audio
    ChunkStart {
        card_id: CardId,
        card_index: u32,
        total_chunks: u32,
        audio_size: u64,
    },
    ChunkComplete {
        card_id: CardId,
        card_index: u32,
    },
    SyncComplete {
        total_cards: u32,
        total_bytes: u64,
    },
    SyncError {
        error: String,
    },
    OpCardCreate {
        card: Card,
        audio_size: u64,
    },
    OpCardUpdate {
        card_id: CardId,
        changes: CardChanges,
    },
    OpCardDelete {
        card_id: CardId,
    },
    OpCardReorder {
        card_order: Vec<CardOrder>,
    },
    OpCardAudioChange {
        card_id: CardId,
        duration: f64,
        audio_size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        waveform_data: Option<Vec<f32>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
    RoleRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RoleGrant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RoleDeny {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RoleTransferComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Ping,
    Pong,
    /// Sent once before a graceful disconnect
    PeerDisconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ControlMessage {
    /// The wire `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::SyncRequest { .. } => "sync_request",
            ControlMessage::SyncAccept { .. } => "sync_accept",
            ControlMessage::SyncReject { .. } => "sync_reject",
            ControlMessage::ChunkStart { .. } => "chunk_start",
            ControlMessage::ChunkComplete { .. } => "chunk_complete",
            ControlMessage::SyncComplete { .. } => "sync_complete",
            ControlMessage::SyncError { .. } => "sync_error",
            ControlMessage::OpCardCreate { .. } => "op_card_create",
            ControlMessage::OpCardUpdate { .. } => "op_card_update",
            ControlMessage::OpCardDelete { .. } => "op_card_delete",
            ControlMessage::OpCardReorder { .. } => "op_card_reorder",
            ControlMessage::OpCardAudioChange { .. } => "op_card_audio_change",
            ControlMessage::RoleRequest { .. } => "role_request",
            ControlMessage::RoleGrant { .. } => "role_grant",
            ControlMessage::RoleDeny { .. } => "role_deny",
            ControlMessage::RoleTransferComplete { .. } => "role_transfer_complete",
            ControlMessage::Ping => "ping",
            ControlMessage::Pong => "pong",
            ControlMessage::PeerDisconnect { .. } => "peer_disconnect",
        }
    }
}

/// A control message with its envelope fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: ControlMessage,
    pub timestamp: i64,
    pub id: u64,
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

/// An incremental mutation broadcast by the writer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOperation {
    CreateCard { card: Card, audio_size: u64 },
    UpdateCard { card_id: CardId, changes: CardChanges },
    DeleteCard { card_id: CardId },
    Reorder { card_order: Vec<CardOrder> },
    AudioChange {
        card_id: CardId,
        meta: AudioMeta,
        audio_size: u64,
    },
}

impl SyncOperation {
    pub fn name(&self) -> &'static str {
        match self {
            SyncOperation::CreateCard { .. } => "op_card_create",
            SyncOperation::UpdateCard { .. } => "op_card_update",
            SyncOperation::DeleteCard { .. } => "op_card_delete",
            SyncOperation::Reorder { .. } => "op_card_reorder",
            SyncOperation::AudioChange { .. } => "op_card_audio_change",
        }
    }

    /// Extract the operation carried by a control message, if any
    pub fn from_message(message: &ControlMessage) -> Option<Self> {
        let op = match message {
            ControlMessage::OpCardCreate { card, audio_size } => SyncOperation::CreateCard {
                card: card.clone(),
                audio_size: *audio_size,
            },
            ControlMessage::OpCardUpdate { card_id, changes } => SyncOperation::UpdateCard {
                card_id: *card_id,
                changes: changes.clone(),
            },
            ControlMessage::OpCardDelete { card_id } => {
                SyncOperation::DeleteCard { card_id: *card_id }
            }
            ControlMessage::OpCardReorder { card_order } => SyncOperation::Reorder {
                card_order: card_order.clone(),
            },
            ControlMessage::OpCardAudioChange {
                card_id,
                duration,
                audio_size,
                waveform_data,
                transcript,
            } => SyncOperation::AudioChange {
                card_id: *card_id,
                meta: AudioMeta {
                    duration: *duration,
                    waveform_data: waveform_data.clone(),
                    transcript: transcript.clone(),
                },
                audio_size: *audio_size,
            },
            _ => return None,
        };
        Some(op)
    }

    pub fn into_message(self) -> ControlMessage {
        match self {
            SyncOperation::CreateCard { card, audio_size } => {
                ControlMessage::OpCardCreate { card, audio_size }
            }
            SyncOperation::UpdateCard { card_id, changes } => {
                ControlMessage::OpCardUpdate { card_id, changes }
            }
            SyncOperation::DeleteCard { card_id } => ControlMessage::OpCardDelete { card_id },
            SyncOperation::Reorder { card_order } => ControlMessage::OpCardReorder { card_order },
            SyncOperation::AudioChange {
                card_id,
                meta,
                audio_size,
            } => ControlMessage::OpCardAudioChange {
                card_id,
                duration: meta.duration,
                audio_size,
                waveform_data: meta.waveform_data,
                transcript: meta.transcript,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_header_layout() {
        let frame = ChunkHeader::new(1, 0x0102_0304).encode_frame(b"abc");
        assert_eq!(&frame[..8], &[1, 0, 0, 0, 4, 3, 2, 1]);
        assert_eq!(&frame[8..], b"abc");

        let (header, payload) = ChunkHeader::decode_frame(frame).unwrap();
        assert_eq!(header, ChunkHeader::new(1, 0x0102_0304));
        assert_eq!(&payload[..], b"abc");
    }

    #[test]
    fn test_short_frame_is_malformed() {
        let err = ChunkHeader::decode_frame(Bytes::from_static(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn test_chunk_count_boundaries() {
        let chunk = 16 * 1024;
        assert_eq!(chunk_count(0, chunk), 0);
        assert_eq!(chunk_count(1, chunk), 1);
        assert_eq!(chunk_count(16 * 1024, chunk), 1);
        assert_eq!(chunk_count(16 * 1024 + 1, chunk), 2);
        assert_eq!(chunk_count(20 * 1024, chunk), 2);
    }

    #[test]
    fn test_envelope_wire_format() {
        let card_id = CardId::new();
        let envelope = Envelope {
            message: ControlMessage::ChunkStart {
                card_id,
                card_index: 2,
                total_chunks: 2,
                audio_size: 20480,
            },
            timestamp: 1_700_000_000_000,
            id: 9,
        };
        let json: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "chunk_start");
        assert_eq!(json["cardId"], card_id.to_string());
        assert_eq!(json["cardIndex"], 2);
        assert_eq!(json["totalChunks"], 2);
        assert_eq!(json["audioSize"], 20480);
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
        assert_eq!(json["id"], 9);
    }

    #[test]
    fn test_sync_request_decodes() {
        let card = Card::new("Chorus", 0).with_duration(2.5);
        let envelope = Envelope {
            message: ControlMessage::SyncRequest {
                project: ProjectMeta::new(),
                cards: vec![CardManifest {
                    card: card.clone(),
                    audio_size: 8192,
                }],
                total_audio_bytes: 8192,
            },
            timestamp: 1,
            id: 1,
        };
        let bytes = envelope.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["totalAudioBytes"], 8192);
        assert_eq!(json["cards"][0]["audioSize"], 8192);
        assert_eq!(json["cards"][0]["label"], "Chorus");

        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_unit_messages() {
        let json = br#"{"type":"ping","timestamp":5,"id":3}"#;
        let envelope = Envelope::decode(json).unwrap();
        assert_eq!(envelope.message, ControlMessage::Ping);
        assert_eq!(envelope.message.name(), "ping");
    }

    #[test]
    fn test_optional_reason() {
        let json = br#"{"type":"role_deny","reason":"busy","timestamp":5,"id":3}"#;
        let envelope = Envelope::decode(json).unwrap();
        assert_eq!(
            envelope.message,
            ControlMessage::RoleDeny {
                reason: Some("busy".into())
            }
        );

        let json = br#"{"type":"role_request","timestamp":5,"id":4}"#;
        let envelope = Envelope::decode(json).unwrap();
        assert_eq!(envelope.message, ControlMessage::RoleRequest { reason: None });
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let json = br#"{"type":"teleport","timestamp":5,"id":3}"#;
        assert!(matches!(
            Envelope::decode(json),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_operation_message_mapping() {
        let op = SyncOperation::AudioChange {
            card_id: CardId::new(),
            meta: AudioMeta {
                duration: 3.0,
                waveform_data: Some(vec![0.5, 0.25]),
                transcript: None,
            },
            audio_size: 100,
        };
        let message = op.clone().into_message();
        assert_eq!(message.name(), op.name());
        assert_eq!(SyncOperation::from_message(&message), Some(op));
        assert_eq!(SyncOperation::from_message(&ControlMessage::Ping), None);
    }
}
