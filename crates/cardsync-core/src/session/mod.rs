//! Sync session: every state machine composed behind one actor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SessionHandle (cloneable, any task)                            │
//! │  └── commands ──► mpsc ──┐                                      │
//! │                          ▼                                      │
//! │  SessionActor (one task; owns all state)                        │
//! │  ├── ConnectionManager    handshake, link lifecycle             │
//! │  ├── SyncChannelTransport control + binary channels             │
//! │  ├── OutgoingSync / IncomingSync   initial sync                 │
//! │  ├── OperationBroadcaster live operations, no-echo              │
//! │  ├── RoleCoordinator      single writer                         │
//! │  └── HeartbeatMonitor     liveness                              │
//! │       │                                                         │
//! │       ├── jobs ──► streamer task ── reports ──► actor           │
//! │       ├── status ──► watch<SessionStatus>                       │
//! │       └── events ──► broadcast<SessionEvent>                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The actor handles one input at a time: a command, an inbound frame, a
//! link event, a timer or a streamer report. Nothing else touches the store
//! on the session's behalf.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::SyncConfig;
use crate::connection::AbortHandle;
use crate::error::{SyncError, SyncResult};
use crate::signaling::HandshakePayload;
use crate::store::ProjectStore;
use crate::transport::Transport;
use crate::types::{AudioMeta, Card, CardChanges, CardId, CardOrder};

mod actor;
mod events;
mod streamer;

pub use events::{SessionEvent, SessionStatus};

use actor::SessionActor;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// A local change to the project
#[derive(Debug)]
pub(crate) enum Mutation {
    Create { card: Card, audio: Option<Bytes> },
    Update { card_id: CardId, changes: CardChanges },
    Delete { card_id: CardId },
    Reorder { card_order: Vec<CardOrder> },
    ChangeAudio {
        card_id: CardId,
        audio: Bytes,
        meta: AudioMeta,
    },
}

impl Mutation {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Mutation::Create { .. } => "op_card_create",
            Mutation::Update { .. } => "op_card_update",
            Mutation::Delete { .. } => "op_card_delete",
            Mutation::Reorder { .. } => "op_card_reorder",
            Mutation::ChangeAudio { .. } => "op_card_audio_change",
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    CreateOffer(Reply<HandshakePayload>),
    AcceptOffer(String, Reply<HandshakePayload>),
    AcceptAnswer(String, Reply<()>),
    Disconnect { graceful: bool, reply: Reply<()> },
    Mutate(Mutation, Reply<()>),
    PushProject(Reply<()>),
    AcceptSync(Reply<()>),
    RejectSync(Option<String>, Reply<()>),
    RequestRole(Option<String>, Reply<()>),
    ApproveRole(Reply<()>),
    DenyRole(Option<String>, Reply<()>),
    SetVisibility { hidden: bool },
}

/// Entry point for starting sessions
pub struct SyncSession;

impl SyncSession {
    /// Spawn a session actor on the current tokio runtime.
    ///
    /// The session lives until every handle is dropped or it is closed.
    pub fn spawn<T: Transport>(
        config: SyncConfig,
        transport: T,
        store: Arc<dyn ProjectStore>,
    ) -> SyncResult<SessionHandle> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let actor = SessionActor::new(config, transport, store, status_tx, event_tx.clone());
        let abort = actor.abort_handle();
        tokio::spawn(actor.run(cmd_rx));

        Ok(SessionHandle {
            cmd_tx,
            status: status_rx,
            events: event_tx,
            abort,
        })
    }
}

/// Cloneable control surface of a running session
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    abort: AbortHandle,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl SessionHandle {
    async fn call<R>(&self, make: impl FnOnce(Reply<R>) -> Command) -> SyncResult<R> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start as the offering peer. Returns the code to hand to the other
    /// peer once gathering has finished.
    pub async fn create_offer(&self) -> SyncResult<HandshakePayload> {
        self.call(Command::CreateOffer).await
    }

    /// Answer an offer code. Returns the answer code to hand back.
    pub async fn accept_offer(&self, code: impl Into<String>) -> SyncResult<HandshakePayload> {
        let code = code.into();
        self.call(|reply| Command::AcceptOffer(code, reply)).await
    }

    /// Apply the answer code from the other peer
    pub async fn accept_answer(&self, code: impl Into<String>) -> SyncResult<()> {
        let code = code.into();
        self.call(|reply| Command::AcceptAnswer(code, reply)).await
    }

    /// End the session. The status reads `closed` once this returns.
    ///
    /// A graceful disconnect tells the peer first; either way, suspended
    /// handshake steps and transfers are abandoned.
    pub async fn disconnect(&self, graceful: bool) -> SyncResult<()> {
        // Interrupt gathering first: the actor may be suspended in it
        self.abort.abort();
        self.call(|reply| Command::Disconnect { graceful, reply })
            .await
    }

    /// Add a card, optionally with audio
    pub async fn create_card(&self, card: Card, audio: Option<Bytes>) -> SyncResult<()> {
        self.call(|reply| Command::Mutate(Mutation::Create { card, audio }, reply))
            .await
    }

    pub async fn update_card(&self, card_id: CardId, changes: CardChanges) -> SyncResult<()> {
        self.call(|reply| Command::Mutate(Mutation::Update { card_id, changes }, reply))
            .await
    }

    pub async fn delete_card(&self, card_id: CardId) -> SyncResult<()> {
        self.call(|reply| Command::Mutate(Mutation::Delete { card_id }, reply))
            .await
    }

    pub async fn reorder_cards(&self, card_order: Vec<CardOrder>) -> SyncResult<()> {
        self.call(|reply| Command::Mutate(Mutation::Reorder { card_order }, reply))
            .await
    }

    /// Replace a card's audio along with its derived metadata
    pub async fn change_audio(&self, card_id: CardId, audio: Bytes, meta: AudioMeta) -> SyncResult<()> {
        self.call(|reply| {
            Command::Mutate(
                Mutation::ChangeAudio {
                    card_id,
                    audio,
                    meta,
                },
                reply,
            )
        })
        .await
    }

    /// Offer our whole project to the peer (writer only)
    pub async fn push_project(&self) -> SyncResult<()> {
        self.call(Command::PushProject).await
    }

    /// Confirm the pending overwrite of our project
    pub async fn accept_sync(&self) -> SyncResult<()> {
        self.call(Command::AcceptSync).await
    }

    /// Decline the pending overwrite; nothing local changes
    pub async fn reject_sync(&self, reason: Option<String>) -> SyncResult<()> {
        self.call(|reply| Command::RejectSync(reason, reply)).await
    }

    /// Ask the peer for the writer role
    pub async fn request_role(&self, reason: Option<String>) -> SyncResult<()> {
        self.call(|reply| Command::RequestRole(reason, reply)).await
    }

    pub async fn approve_role(&self) -> SyncResult<()> {
        self.call(Command::ApproveRole).await
    }

    pub async fn deny_role(&self, reason: Option<String>) -> SyncResult<()> {
        self.call(|reply| Command::DenyRole(reason, reply)).await
    }

    /// Tell the session whether the host is in the background
    pub fn set_visibility(&self, hidden: bool) -> SyncResult<()> {
        self.cmd_tx
            .send(Command::SetVisibility { hidden })
            .map_err(|_| SyncError::SessionClosed)
    }
}
