//! Connection lifecycle
//!
//! [`ConnectionManager`] owns the session's single [`ConnectionState`] and
//! drives the handshake:
//!
//! ```text
//!  offerer                                   answerer
//!  ───────                                   ────────
//!  idle                                      idle
//!   │ create_offer()                          │
//!  creating_offer ── gather ──┐               │
//!  awaiting_answer ◄──────────┘  code A ──►   │ accept_offer(A)
//!   │                                        creating_answer ── gather
//!   │ accept_answer(B)      ◄── code B ──    negotiating ── accept()
//!  negotiating ── dial()                      │
//!   └──────────────► LinkEvent::Established ◄─┘
//! ```
//!
//! Negotiation runs in a background task and reports back through a
//! [`LinkEvent`]; the owner opens the data channels and then calls
//! [`ConnectionManager::mark_connected`]. There is no automatic retry: a
//! failed attempt is recovered only by a fresh handshake from `idle`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{HandshakeError, SyncError, SyncResult, TransportError};
use crate::signaling::{
    DescriptionKind, HandshakePayload, SessionDescription, SessionId, SignalingCodec,
};
use crate::transport::{LinkPair, PendingLink, Transport};

/// Lifecycle of the session's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    CreatingOffer,
    AwaitingAnswer,
    CreatingAnswer,
    Negotiating,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::CreatingOffer => "creating_offer",
            ConnectionState::AwaitingAnswer => "awaiting_answer",
            ConnectionState::CreatingAnswer => "creating_answer",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// States from which a fresh handshake may start
    pub fn can_start_handshake(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Failed | ConnectionState::Closed
        )
    }

    /// States with an established link (possibly unhealthy)
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a background negotiation
pub enum LinkEvent {
    Established { attempt: u64, link: LinkPair },
    Failed { attempt: u64, error: SyncError },
}

impl LinkEvent {
    pub fn attempt(&self) -> u64 {
        match self {
            LinkEvent::Established { attempt, .. } | LinkEvent::Failed { attempt, .. } => *attempt,
        }
    }
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::Established { attempt, link } => f
                .debug_struct("Established")
                .field("attempt", attempt)
                .field("remote", &link.remote)
                .finish(),
            LinkEvent::Failed { attempt, error } => f
                .debug_struct("Failed")
                .field("attempt", attempt)
                .field("error", error)
                .finish(),
        }
    }
}

/// Cancels whatever handshake step is currently suspended.
///
/// Held outside the owner of the [`ConnectionManager`] so a disconnect can
/// interrupt gathering even while the owner is awaiting it.
#[derive(Clone, Default)]
pub struct AbortHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.current.lock().cancel();
    }

    fn renew(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock() = token.clone();
        token
    }

    fn token(&self) -> CancellationToken {
        self.current.lock().clone()
    }
}

/// Owns the transport lifecycle for one session
pub struct ConnectionManager<T: Transport> {
    transport: T,
    codec: SignalingCodec,
    config: SyncConfig,
    state: watch::Sender<ConnectionState>,
    session_id: Option<SessionId>,
    pending: Option<T::Pending>,
    is_offerer: bool,
    attempt: u64,
    abort: AbortHandle,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager; established links are delivered on the returned
    /// receiver.
    pub fn new(transport: T, config: SyncConfig) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let manager = Self {
            transport,
            codec: SignalingCodec::new(config.handshake_validity_secs),
            config,
            state,
            session_id: None,
            pending: None,
            is_offerer: false,
            attempt: 0,
            abort: AbortHandle::default(),
            link_tx,
        };
        (manager, link_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Whether this side created the offer in the current attempt
    pub fn is_offerer(&self) -> bool {
        self.is_offerer
    }

    /// The attempt counter; link events from older attempts are stale
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "Connection state");
        }
    }

    fn require(&self, op: &'static str, ok: bool) -> SyncResult<()> {
        if ok {
            Ok(())
        } else {
            Err(HandshakeError::WrongState {
                op,
                state: self.state().to_string(),
            }
            .into())
        }
    }

    fn begin_attempt(&mut self) -> CancellationToken {
        self.attempt += 1;
        self.pending = None;
        self.abort.renew()
    }

    /// Gather candidates within the gathering window, or give up.
    ///
    /// Borrows only the transport, so the manager itself never has to be
    /// shared across the await.
    async fn gather(
        transport: &T,
        window: Duration,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> SyncResult<T::Pending> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled.into()),
            result = tokio::time::timeout(window, transport.gather(session_id)) => {
                match result {
                    Ok(pending) => pending,
                    Err(_) => Err(HandshakeError::NetworkUnreachable(format!(
                        "no network path found within {}s",
                        window.as_secs()
                    ))
                    .into()),
                }
            }
        }
    }

    /// Start a session as the offering peer.
    ///
    /// Returns only after gathering has finished, since a shared code cannot
    /// be amended with late candidates.
    pub async fn create_offer(&mut self) -> SyncResult<HandshakePayload> {
        self.require("create an offer", self.state().can_start_handshake())?;
        let cancel = self.begin_attempt();
        let session_id = SessionId::new();
        self.session_id = Some(session_id);
        self.is_offerer = true;
        self.set_state(ConnectionState::CreatingOffer);

        let window = self.config.gathering_timeout();
        let pending = match Self::gather(&self.transport, window, session_id, &cancel).await {
            Ok(pending) => pending,
            Err(e) => {
                self.fail_attempt(&e);
                return Err(e);
            }
        };

        let description = SessionDescription::offer(session_id, pending.endpoint());
        let code = match self.codec.encode(&description) {
            Ok(code) => code,
            Err(e) => {
                let e = SyncError::from(e);
                self.fail_attempt(&e);
                return Err(e);
            }
        };

        self.pending = Some(pending);
        self.set_state(ConnectionState::AwaitingAnswer);
        info!(session = %session_id, len = code.as_str().len(), "Offer ready");
        Ok(code)
    }

    /// Answer a peer's offer code. Negotiation continues in the background
    /// until the offerer dials in.
    pub async fn accept_offer(&mut self, code: &str) -> SyncResult<HandshakePayload> {
        self.require("accept an offer", self.state().can_start_handshake())?;
        let offer = self.codec.decode(code)?;
        if offer.kind != DescriptionKind::Offer {
            return Err(HandshakeError::MalformedCode("expected an offer code".into()).into());
        }

        let cancel = self.begin_attempt();
        let session_id = offer.session_id;
        self.session_id = Some(session_id);
        self.is_offerer = false;
        self.set_state(ConnectionState::CreatingAnswer);

        let window = self.config.gathering_timeout();
        let pending = match Self::gather(&self.transport, window, session_id, &cancel).await {
            Ok(pending) => pending,
            Err(e) => {
                self.fail_attempt(&e);
                return Err(e);
            }
        };

        let description = SessionDescription::answer(session_id, pending.endpoint());
        let code = match self.codec.encode(&description) {
            Ok(code) => code,
            Err(e) => {
                let e = SyncError::from(e);
                self.fail_attempt(&e);
                return Err(e);
            }
        };

        self.set_state(ConnectionState::Negotiating);
        self.negotiate(cancel, pending.accept(offer));
        info!(session = %session_id, len = code.as_str().len(), "Answer ready");
        Ok(code)
    }

    /// Apply the peer's answer code and dial it.
    pub fn accept_answer(&mut self, code: &str) -> SyncResult<()> {
        self.require(
            "accept an answer",
            self.state() == ConnectionState::AwaitingAnswer,
        )?;
        let answer = self.codec.decode(code)?;
        if answer.kind != DescriptionKind::Answer {
            return Err(HandshakeError::MalformedCode("expected an answer code".into()).into());
        }
        if Some(answer.session_id) != self.session_id {
            return Err(HandshakeError::MalformedCode(
                "answer belongs to a different session".into(),
            )
            .into());
        }

        let pending = self.pending.take().ok_or_else(|| HandshakeError::WrongState {
            op: "accept an answer",
            state: "no pending offer".into(),
        })?;
        self.set_state(ConnectionState::Negotiating);
        self.negotiate(self.abort.token(), pending.dial(answer));
        Ok(())
    }

    fn negotiate(
        &self,
        cancel: CancellationToken,
        connect: impl std::future::Future<Output = SyncResult<LinkPair>> + Send + 'static,
    ) {
        let attempt = self.attempt;
        let window = self.config.negotiation_timeout();
        let link_tx = self.link_tx.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(window, connect) => result,
            };
            let event = match outcome {
                Ok(Ok(link)) => LinkEvent::Established { attempt, link },
                Ok(Err(error)) => LinkEvent::Failed { attempt, error },
                Err(_) => LinkEvent::Failed {
                    attempt,
                    error: HandshakeError::NegotiationTimedOut(window.as_secs()).into(),
                },
            };
            let _ = link_tx.send(event);
        });
    }

    /// Whether a link event belongs to the current attempt
    pub fn is_current(&self, event: &LinkEvent) -> bool {
        event.attempt() == self.attempt && self.state() == ConnectionState::Negotiating
    }

    fn fail_attempt(&mut self, error: &SyncError) {
        warn!(error = %error, "Handshake failed");
        self.pending = None;
        self.set_state(ConnectionState::Failed);
    }

    /// Negotiation reported a failure for the current attempt
    pub fn negotiation_failed(&mut self, error: &SyncError) {
        self.fail_attempt(error);
    }

    /// Both channels are open
    pub fn mark_connected(&self) {
        info!(session = ?self.session_id.map(|s| s.to_string()), "Connected");
        self.set_state(ConnectionState::Connected);
    }

    /// Liveness is in doubt but the link is still up
    pub fn mark_reconnecting(&self) {
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Reconnecting);
        }
    }

    /// Liveness restored after probing
    pub fn mark_recovered(&self) {
        if self.state() == ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connected);
        }
    }

    /// The link was lost; a new handshake is needed
    pub fn mark_failed(&mut self) {
        self.abort.abort();
        self.pending = None;
        self.set_state(ConnectionState::Failed);
    }

    /// Tear down whatever is in progress and move to `closed`.
    ///
    /// Sending the farewell message is the caller's job; this only stops
    /// pending handshake work.
    pub fn disconnect(&mut self) {
        self.abort.abort();
        self.pending = None;
        self.attempt += 1;
        self.set_state(ConnectionState::Closed);
    }
}
