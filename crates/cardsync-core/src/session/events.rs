//! What a session publishes to its host
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SessionStatus (watch): the current state, always readable      │
//! │  ├── connection / reconnection / role states                    │
//! │  ├── can_write: the single write predicate                      │
//! │  └── initial_sync phase, resync_recommended                     │
//! │                                                                 │
//! │  SessionEvent (broadcast): things that happened                 │
//! │  ├── link: Connected, HandshakeFailed, ConnectionLost, PeerLeft │
//! │  ├── initial sync: requested, progress, completed, failed       │
//! │  ├── role: requested, granted, denied, transferred, expired     │
//! │  └── diagnostics: ProtocolError, OperationDropped               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;

use crate::connection::ConnectionState;
use crate::heartbeat::ReconnectionState;
use crate::initial_sync::{InitialSyncPhase, PendingSyncRequest, SyncProgress};
use crate::role::RoleTransferState;

/// Snapshot of every state machine in the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub connection: ConnectionState,
    pub reconnection: ReconnectionState,
    pub role: RoleTransferState,
    /// This peer is the writer (even mid-handoff)
    pub holds_role: bool,
    /// Local mutations are applied and broadcast
    pub can_write: bool,
    pub initial_sync: InitialSyncPhase,
    /// Some operations never reached the peer; a fresh initial sync will
    /// reconcile
    pub resync_recommended: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Idle,
            reconnection: ReconnectionState::Stable,
            role: RoleTransferState::Idle,
            holds_role: false,
            can_write: false,
            initial_sync: InitialSyncPhase::Idle,
            resync_recommended: false,
        }
    }
}

/// Notifications from a running session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Both channels are open
    Connected { remote: String, is_writer: bool },
    /// The handshake attempt failed; start over from a new code
    HandshakeFailed { error: String },
    /// The link died; start a new session
    ConnectionLost { reason: String },
    /// The peer disconnected on purpose
    PeerLeft { reason: Option<String> },
    /// Pings went unanswered; writes are paused
    Probing,
    /// The peer answered again
    Recovered,

    /// The peer wants to replace our project with theirs
    SyncRequested(PendingSyncRequest),
    /// Receiving progress
    SyncProgress(SyncProgress),
    /// Sending progress
    UploadProgress(SyncProgress),
    /// We replaced our project with the peer's
    SyncCompleted { cards: usize, bytes: u64 },
    /// Our project was fully sent
    SyncSent,
    SyncRejected { reason: Option<String> },
    SyncFailed { error: String },

    /// A remote operation was applied to the local store
    RemoteOperation { op: &'static str },
    RoleRequested { reason: Option<String> },
    /// We are now the writer
    RoleGranted,
    RoleDenied { reason: Option<String> },
    /// The peer took over the writer role
    RoleTransferred,
    /// Our role request went unanswered
    RoleRequestExpired,

    /// A local operation could not be delivered
    OperationDropped { op: &'static str, error: String },
    /// The peer misbehaved; the offending message was dropped
    ProtocolError { message: String },
}

impl SessionEvent {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::HandshakeFailed { .. } => "handshake_failed",
            SessionEvent::ConnectionLost { .. } => "connection_lost",
            SessionEvent::PeerLeft { .. } => "peer_left",
            SessionEvent::Probing => "probing",
            SessionEvent::Recovered => "recovered",
            SessionEvent::SyncRequested(_) => "sync_requested",
            SessionEvent::SyncProgress(_) => "sync_progress",
            SessionEvent::UploadProgress(_) => "upload_progress",
            SessionEvent::SyncCompleted { .. } => "sync_completed",
            SessionEvent::SyncSent => "sync_sent",
            SessionEvent::SyncRejected { .. } => "sync_rejected",
            SessionEvent::SyncFailed { .. } => "sync_failed",
            SessionEvent::RemoteOperation { .. } => "remote_operation",
            SessionEvent::RoleRequested { .. } => "role_requested",
            SessionEvent::RoleGranted => "role_granted",
            SessionEvent::RoleDenied { .. } => "role_denied",
            SessionEvent::RoleTransferred => "role_transferred",
            SessionEvent::RoleRequestExpired => "role_request_expired",
            SessionEvent::OperationDropped { .. } => "operation_dropped",
            SessionEvent::ProtocolError { .. } => "protocol_error",
        }
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Connected { remote, is_writer } => write!(
                f,
                "Connected to {} as {}",
                remote,
                if *is_writer { "writer" } else { "viewer" }
            ),
            SessionEvent::HandshakeFailed { error } => write!(f, "Handshake failed: {}", error),
            SessionEvent::ConnectionLost { reason } => {
                write!(f, "Connection lost ({}), start a new session", reason)
            }
            SessionEvent::PeerLeft { reason } => match reason {
                Some(reason) => write!(f, "Peer left: {}", reason),
                None => write!(f, "Peer left"),
            },
            SessionEvent::Probing => write!(f, "Peer not answering, probing"),
            SessionEvent::Recovered => write!(f, "Peer answering again"),
            SessionEvent::SyncRequested(req) => write!(
                f,
                "Peer offers a project: {} cards, {} audio bytes",
                req.card_count, req.total_audio_bytes
            ),
            SessionEvent::SyncProgress(p) | SessionEvent::UploadProgress(p) => write!(
                f,
                "{}/{} bytes, record {}/{}",
                p.bytes_transferred,
                p.bytes_total,
                p.current_record_index + 1,
                p.total_records
            ),
            SessionEvent::SyncCompleted { cards, bytes } => {
                write!(f, "Project received: {} cards, {} bytes", cards, bytes)
            }
            SessionEvent::SyncSent => write!(f, "Project sent"),
            SessionEvent::SyncRejected { reason } => {
                write!(f, "Peer rejected the project")?;
                if let Some(reason) = reason {
                    write!(f, ": {}", reason)?;
                }
                Ok(())
            }
            SessionEvent::SyncFailed { error } => write!(f, "Initial sync failed: {}", error),
            SessionEvent::RemoteOperation { op } => write!(f, "Applied {}", op),
            SessionEvent::RoleRequested { reason } => {
                write!(f, "Peer requests the writer role")?;
                if let Some(reason) = reason {
                    write!(f, ": {}", reason)?;
                }
                Ok(())
            }
            SessionEvent::RoleGranted => write!(f, "You are now the writer"),
            SessionEvent::RoleDenied { reason } => {
                write!(f, "Role request denied")?;
                if let Some(reason) = reason {
                    write!(f, ": {}", reason)?;
                }
                Ok(())
            }
            SessionEvent::RoleTransferred => write!(f, "Peer is now the writer"),
            SessionEvent::RoleRequestExpired => write!(f, "Role request expired"),
            SessionEvent::OperationDropped { op, error } => {
                write!(f, "{} not delivered: {}", op, error)
            }
            SessionEvent::ProtocolError { message } => write!(f, "Protocol error: {}", message),
        }
    }
}
