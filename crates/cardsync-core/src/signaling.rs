//! Handshake codes for connecting two peers without a signaling server.
//!
//! A handshake code carries one side's offer or answer together with every
//! network candidate gathered for it. Codes are relayed by a human (copy and
//! paste, or a QR code), so they must be short, survive whitespace mangling,
//! and fail loudly when corrupted.
//!
//! Codes are encoded as `cs1.{base64url}` where the payload is
//! `zstd(postcard(SessionDescription)) || blake3(...)[..4]`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::HandshakeError;

/// Prefix for encoded handshake codes
const CODE_PREFIX: &str = "cs1.";

/// Current handshake format version
pub const HANDSHAKE_VERSION: u8 = 1;

/// Longest code accepted by `decode`, not counting whitespace
pub const MAX_CODE_LEN: usize = 4096;

/// Longest input `decode` looks at, whitespace included
const MAX_WRAPPED_CODE_LEN: usize = 4 * MAX_CODE_LEN;

/// Upper bound on the decompressed description
const MAX_DESCRIPTION_BYTES: usize = 64 * 1024;

const CHECKSUM_LEN: usize = 4;

const COMPRESSION_LEVEL: i32 = 19;

/// Allowed clock skew for codes stamped in the future
const MAX_FUTURE_SKEW_SECS: i64 = 60;

/// Identifies one connection attempt; both codes of a handshake share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    /// Create a new random SessionId
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Whether a description starts or answers a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Portable network address of one peer: its key plus every gathered
/// direct address candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Node public key (32 bytes)
    pub node_id: [u8; 32],
    /// Direct socket addresses as strings (e.g., "192.168.1.1:4433")
    pub direct_addresses: Vec<String>,
}

impl EndpointInfo {
    pub fn new(node_id: [u8; 32]) -> Self {
        Self {
            node_id,
            direct_addresses: Vec::new(),
        }
    }

    pub fn with_address(mut self, addr: impl Into<String>) -> Self {
        self.direct_addresses.push(addr.into());
        self
    }

    pub fn with_addresses(mut self, addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.direct_addresses
            .extend(addrs.into_iter().map(|a| a.into()));
        self
    }
}

/// One side of a handshake, before encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub version: u8,
    pub kind: DescriptionKind,
    pub session_id: SessionId,
    pub endpoint: EndpointInfo,
    /// Unix seconds when the candidates were gathered
    pub created_at: i64,
}

impl SessionDescription {
    pub fn offer(session_id: SessionId, endpoint: EndpointInfo) -> Self {
        Self::new(DescriptionKind::Offer, session_id, endpoint)
    }

    pub fn answer(session_id: SessionId, endpoint: EndpointInfo) -> Self {
        Self::new(DescriptionKind::Answer, session_id, endpoint)
    }

    fn new(kind: DescriptionKind, session_id: SessionId, endpoint: EndpointInfo) -> Self {
        Self {
            version: HANDSHAKE_VERSION,
            kind,
            session_id,
            endpoint,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// An encoded, human-relayable handshake code.
///
/// Immutable once generated; it has no identity beyond its string value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandshakePayload(String);

impl HandshakePayload {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for HandshakePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<HandshakePayload> for String {
    fn from(payload: HandshakePayload) -> Self {
        payload.0
    }
}

/// Encodes and decodes handshake codes, enforcing their validity window.
#[derive(Debug, Clone)]
pub struct SignalingCodec {
    validity_secs: i64,
}

impl SignalingCodec {
    /// Create a codec that rejects codes older than `validity_secs`
    pub fn new(validity_secs: i64) -> Self {
        Self { validity_secs }
    }

    /// Encode a description as a `cs1.{base64url}` code.
    pub fn encode(&self, description: &SessionDescription) -> Result<HandshakePayload, HandshakeError> {
        let raw = postcard::to_allocvec(description)
            .map_err(|e| HandshakeError::MalformedCode(format!("Failed to encode description: {}", e)))?;
        let mut packed = zstd::bulk::compress(&raw, COMPRESSION_LEVEL)
            .map_err(|e| HandshakeError::MalformedCode(format!("Failed to compress description: {}", e)))?;

        let checksum = blake3::hash(&packed);
        packed.extend_from_slice(&checksum.as_bytes()[..CHECKSUM_LEN]);

        Ok(HandshakePayload(format!(
            "{}{}",
            CODE_PREFIX,
            URL_SAFE_NO_PAD.encode(&packed)
        )))
    }

    /// Decode a code, checking its checksum and validity window.
    ///
    /// Whitespace anywhere in the input is ignored so that codes wrapped by
    /// a terminal or chat client still decode.
    pub fn decode(&self, code: &str) -> Result<SessionDescription, HandshakeError> {
        self.decode_at(code, chrono::Utc::now().timestamp())
    }

    /// Decode as if the current time were `now` (unix seconds)
    pub fn decode_at(&self, code: &str, now: i64) -> Result<SessionDescription, HandshakeError> {
        if code.len() > MAX_WRAPPED_CODE_LEN {
            return Err(HandshakeError::TooLarge {
                len: code.len(),
                max: MAX_WRAPPED_CODE_LEN,
            });
        }

        let compact: String = code.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() > MAX_CODE_LEN {
            return Err(HandshakeError::TooLarge {
                len: compact.len(),
                max: MAX_CODE_LEN,
            });
        }
        let data = compact.strip_prefix(CODE_PREFIX).ok_or_else(|| {
            HandshakeError::MalformedCode(format!(
                "Invalid prefix: expected '{}', got '{}'",
                CODE_PREFIX,
                compact.chars().take(8).collect::<String>()
            ))
        })?;

        let bytes = URL_SAFE_NO_PAD
            .decode(data)
            .map_err(|e| HandshakeError::MalformedCode(format!("Invalid base64: {}", e)))?;
        if bytes.len() <= CHECKSUM_LEN {
            return Err(HandshakeError::MalformedCode("Code is truncated".into()));
        }

        let (packed, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if blake3::hash(packed).as_bytes()[..CHECKSUM_LEN] != *checksum {
            return Err(HandshakeError::MalformedCode("Checksum mismatch".into()));
        }

        let raw = zstd::bulk::decompress(packed, MAX_DESCRIPTION_BYTES)
            .map_err(|e| HandshakeError::MalformedCode(format!("Invalid compression: {}", e)))?;
        let description: SessionDescription = postcard::from_bytes(&raw)
            .map_err(|e| HandshakeError::MalformedCode(format!("Invalid description: {}", e)))?;

        if description.version != HANDSHAKE_VERSION {
            return Err(HandshakeError::MalformedCode(format!(
                "Unsupported handshake version {}",
                description.version
            )));
        }

        // A forged timestamp far from `now` saturates into an expired age
        let age_secs = now.saturating_sub(description.created_at);
        if age_secs > self.validity_secs || age_secs < -MAX_FUTURE_SKEW_SECS {
            return Err(HandshakeError::Expired { age_secs });
        }

        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_node_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0x01;
        id[31] = 0xFF;
        id
    }

    fn make_offer() -> SessionDescription {
        SessionDescription::offer(
            SessionId::new(),
            EndpointInfo::new(make_test_node_id())
                .with_addresses(["192.168.1.10:50123", "[fe80::1]:50123", "10.0.0.4:50123"]),
        )
    }

    fn codec() -> SignalingCodec {
        SignalingCodec::new(600)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let offer = make_offer();
        let code = codec().encode(&offer).unwrap();
        assert!(code.as_str().starts_with(CODE_PREFIX));

        let decoded = codec().decode(code.as_str()).unwrap();
        assert_eq!(decoded, offer);
        assert_eq!(decoded.kind, DescriptionKind::Offer);
    }

    #[test]
    fn test_code_is_url_safe() {
        let code = codec().encode(&make_offer()).unwrap();
        assert!(code
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
    }

    #[test]
    fn test_whitespace_is_ignored() {
        let offer = make_offer();
        let code = codec().encode(&offer).unwrap().into_string();
        let wrapped: String = code
            .chars()
            .enumerate()
            .flat_map(|(i, c)| if i % 20 == 19 { vec![c, '\n'] } else { vec![c] })
            .collect();
        let decoded = codec().decode(&format!("  {}  \r\n", wrapped)).unwrap();
        assert_eq!(decoded, offer);
    }

    #[test]
    fn test_corrupted_code_fails_checksum() {
        let code = codec().encode(&make_offer()).unwrap().into_string();
        let mut chars: Vec<char> = code.chars().collect();
        let idx = chars.len() / 2;
        chars[idx] = if chars[idx] == 'A' { 'B' } else { 'A' };
        let corrupted: String = chars.into_iter().collect();

        let err = codec().decode(&corrupted).unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedCode(_)));
    }

    #[test]
    fn test_wrong_prefix() {
        let err = codec().decode("sync-invite:abc123").unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedCode(_)));
        assert!(err.to_string().contains("Invalid prefix"));

        assert!(codec().decode("").is_err());
        assert!(codec().decode("cs1.").is_err());
        assert!(codec().decode("cs1.!!!not-base64").is_err());
    }

    #[test]
    fn test_oversized_code_reports_too_large() {
        let huge = format!("{}{}", CODE_PREFIX, "A".repeat(MAX_CODE_LEN));
        let err = codec().decode(&huge).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::TooLarge {
                len: MAX_CODE_LEN + CODE_PREFIX.len(),
                max: MAX_CODE_LEN
            }
        );
    }

    #[test]
    fn test_heavily_wrapped_code_still_decodes() {
        let offer = make_offer();
        let code = codec().encode(&offer).unwrap().into_string();
        let wrapped: String = code.chars().flat_map(|c| [c, '\n', ' ']).collect();
        let padded = format!("{}{}", wrapped, " ".repeat(MAX_CODE_LEN));
        assert!(padded.len() > MAX_CODE_LEN);

        assert_eq!(codec().decode(&padded).unwrap(), offer);
    }

    #[test]
    fn test_runaway_input_is_too_large() {
        let flood = format!("cs1.{}", " ".repeat(MAX_WRAPPED_CODE_LEN));
        let err = codec().decode(&flood).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::TooLarge {
                len: MAX_WRAPPED_CODE_LEN + CODE_PREFIX.len(),
                max: MAX_WRAPPED_CODE_LEN
            }
        );
    }

    #[test]
    fn test_extreme_timestamps_expire_without_overflow() {
        let mut offer = make_offer();
        offer.created_at = i64::MIN;
        let code = codec().encode(&offer).unwrap();
        let err = codec().decode_at(code.as_str(), 1_700_000_000).unwrap_err();
        assert_eq!(err, HandshakeError::Expired { age_secs: i64::MAX });

        offer.created_at = i64::MAX;
        let code = codec().encode(&offer).unwrap();
        let err = codec().decode_at(code.as_str(), -1_000).unwrap_err();
        assert_eq!(err, HandshakeError::Expired { age_secs: i64::MIN });
    }

    #[test]
    fn test_expired_code() {
        let offer = make_offer();
        let code = codec().encode(&offer).unwrap();

        let later = offer.created_at + 601;
        let err = codec().decode_at(code.as_str(), later).unwrap_err();
        assert_eq!(err, HandshakeError::Expired { age_secs: 601 });

        // Still fine right at the edge of the window
        assert!(codec()
            .decode_at(code.as_str(), offer.created_at + 600)
            .is_ok());
    }

    #[test]
    fn test_code_from_the_future_is_rejected() {
        let offer = make_offer();
        let code = codec().encode(&offer).unwrap();
        let err = codec()
            .decode_at(code.as_str(), offer.created_at - 3600)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Expired { .. }));
    }

    #[test]
    fn test_answer_keeps_session_id() {
        let offer = make_offer();
        let answer = SessionDescription::answer(offer.session_id, EndpointInfo::new([7u8; 32]));
        let code = codec().encode(&answer).unwrap();
        let decoded = codec().decode(code.as_str()).unwrap();
        assert_eq!(decoded.kind, DescriptionKind::Answer);
        assert_eq!(decoded.session_id, offer.session_id);
    }

    #[test]
    fn test_session_ids_are_random() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
