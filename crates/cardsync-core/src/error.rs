//! Error types for Cardsync
//!
//! Errors are grouped the way they are handled: handshake failures end the
//! current connection attempt, transport failures end the session, and
//! protocol failures only drop the offending message or record.

use thiserror::Error;

/// Failures while producing or consuming a handshake code.
///
/// All of these are fatal to the current attempt. Recovery is a fresh
/// handshake from `idle`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The code failed its checksum or could not be parsed
    #[error("Malformed handshake code: {0}")]
    MalformedCode(String),

    /// The code exceeds the accepted length
    #[error("Handshake code too large: {len} chars (max {max})")]
    TooLarge { len: usize, max: usize },

    /// The code is outside its validity window
    #[error("Handshake code expired ({age_secs}s old)")]
    Expired { age_secs: i64 },

    /// No usable network path was found while gathering candidates
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The peer never completed the connection
    #[error("Negotiation timed out after {0}s")]
    NegotiationTimedOut(u64),

    /// Operation is not legal in the current connection state
    #[error("Cannot {op} while {state}")]
    WrongState { op: &'static str, state: String },
}

/// Failures of the underlying channels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel was closed by the peer or torn down locally
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Attempted to send on a channel that is not open
    #[error("Channel not open: {0}")]
    NotOpen(&'static str),

    /// The pre-open control queue is full
    #[error("Control queue full ({0} messages)")]
    QueueFull(usize),

    /// A suspended send was abandoned because the connection closed
    #[error("Send cancelled")]
    Cancelled,

    /// An outgoing frame is larger than the channel carries; nothing was sent
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// I/O failure on the underlying stream
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Failures caused by a misbehaving or out-of-step peer.
///
/// These are logged and the affected message or record is dropped; the
/// connection stays up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A chunk index is outside the declared range or out of order
    #[error("Chunk {chunk_index} out of range for record {record_index} ({total} chunks)")]
    ChunkOutOfRange {
        record_index: u32,
        chunk_index: u32,
        total: u32,
    },

    /// A chunk or message refers to a record the receiver does not know
    #[error("Unknown record: {0}")]
    UnknownRecord(String),

    /// The message is not valid in the current protocol state
    #[error("Unexpected {message} while {state}")]
    UnexpectedMessage { message: String, state: String },

    /// The peer sent a write while not holding the writer role
    #[error("Peer sent {0} without holding the writer role")]
    NotRoleHolder(String),

    /// Reassembled sizes do not match the declared sizes
    #[error("Size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },
}

/// Main error type for Cardsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Handshake failure
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol violation by the peer
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Card was not found in the local store
    #[error("Card not found: {0}")]
    CardNotFound(String),

    /// Local write attempted while connected without the writer role
    #[error("Read-only: {0}")]
    ReadOnly(String),

    /// Operation not allowed in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The session actor has shut down
    #[error("Session closed")]
    SessionClosed,

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether this error ends the session (as opposed to dropping one message).
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Handshake(_) => true,
            SyncError::Transport(TransportError::FrameTooLarge { .. }) => false,
            SyncError::Transport(_) => true,
            _ => false,
        }
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
