//! Cardsync Core Library
//!
//! Live two-peer sync of a voice-memo "cards" project, with no server in
//! between.
//!
//! ## Overview
//!
//! Two people pair their devices by copying a handshake code from one to
//! the other and a second code back. After that:
//!
//! - **Initial sync**: the writer can replace the viewer's project with its
//!   own, audio included, after the viewer confirms
//! - **Live operations**: every edit the writer makes is mirrored on the
//!   viewer as it happens
//! - **Single writer**: exactly one peer edits at a time; the role moves by
//!   request and approval
//! - **Liveness**: heartbeats notice a silent peer and pause writes until it
//!   answers again
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use cardsync_core::{IrohTransport, MemoryStore, SyncConfig, SyncSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = IrohTransport::new();
//!     let store = Arc::new(MemoryStore::new());
//!     let session = SyncSession::spawn(SyncConfig::default(), transport, store)?;
//!
//!     // Hand this to the other peer, then feed their answer back
//!     let offer = session.create_offer().await?;
//!     println!("{}", offer);
//!     # let answer = String::new();
//!     session.accept_answer(answer).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod initial_sync;
pub mod logging;
pub mod protocol;
pub mod reassembly;
pub mod role;
pub mod session;
pub mod signaling;
pub mod store;
pub mod sync_transport;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{SyncConfig, DEFAULT_CHUNK_SIZE, DEFAULT_HIGH_WATER_MARK};
pub use connection::ConnectionState;
pub use error::{HandshakeError, ProtocolError, SyncError, SyncResult, TransportError};
pub use heartbeat::ReconnectionState;
pub use initial_sync::{InitialSyncPhase, PendingSyncRequest, SyncProgress};
pub use protocol::{ControlMessage, SyncOperation};
pub use role::RoleTransferState;
pub use session::{SessionEvent, SessionHandle, SessionStatus, SyncSession};
pub use signaling::{HandshakePayload, SignalingCodec};
pub use store::{MemoryStore, ProjectStore, RedbStore};
pub use transport::{IrohTransport, MemoryNetwork, MemoryTransport, Transport};
pub use types::*;
