//! The session event loop

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::events::{SessionEvent, SessionStatus};
use super::streamer::{spawn_streamer, QueuedJob, StreamReport};
use super::{Command, Mutation, Reply};
use crate::broadcaster::{Broadcast, OperationBroadcaster};
use crate::config::{SyncConfig, DEFAULT_CHUNK_SIZE};
use crate::connection::{AbortHandle, ConnectionManager, ConnectionState, LinkEvent};
use crate::error::{ProtocolError, SyncError, SyncResult, TransportError};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::initial_sync::{
    IncomingSync, IncomingSyncState, IncomingUpdate, InitialSyncPhase, OutgoingSync,
    OutgoingSyncState, StreamJob, StreamKind,
};
use crate::protocol::{
    ChunkHeader, ControlMessage, Envelope, SyncOperation, CHUNK_HEADER_LEN, LIVE_RECORD_BASE,
};
use crate::role::{RoleCoordinator, RoleTimeout};
use crate::signaling::HandshakePayload;
use crate::store::ProjectStore;
use crate::sync_transport::SyncChannelTransport;
use crate::transport::{ChannelEvent, ChannelKind, DataChannel, LinkPair, Transport};
use crate::types::ProjectSnapshot;

/// How long link resources outlive a graceful shutdown, so queued frames
/// reach the peer
const LINGER: Duration = Duration::from_secs(1);

struct ActiveLink {
    remote: String,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    reports: mpsc::UnboundedReceiver<StreamReport>,
    jobs: mpsc::UnboundedSender<QueuedJob>,
    cancel: CancellationToken,
    keepalive: Box<dyn Any + Send>,
}

enum LinkInput {
    Channel(Option<ChannelEvent>),
    Report(Option<StreamReport>),
}

async fn next_link_input(link: &mut Option<ActiveLink>) -> LinkInput {
    match link {
        Some(link) => tokio::select! {
            event = link.events.recv() => LinkInput::Channel(event),
            report = link.reports.recv() => LinkInput::Report(report),
        },
        None => std::future::pending().await,
    }
}

/// Drive a handshake step, copying the connection states it passes
/// through into the published status while it is suspended.
async fn track_states<R>(
    status: &watch::Sender<SessionStatus>,
    mut states: watch::Receiver<ConnectionState>,
    step: impl Future<Output = R>,
) -> R {
    tokio::pin!(step);
    loop {
        tokio::select! {
            result = &mut step => return result,
            Ok(()) = states.changed() => {
                let state = *states.borrow_and_update();
                status.send_if_modified(|current| {
                    let changed = current.connection != state;
                    current.connection = state;
                    changed
                });
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(super) struct SessionActor<T: Transport> {
    config: SyncConfig,
    connection: ConnectionManager<T>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    channels: SyncChannelTransport,
    link: Option<ActiveLink>,
    outgoing: OutgoingSync,
    incoming: IncomingSync,
    broadcaster: OperationBroadcaster,
    role: RoleCoordinator,
    heartbeat: HeartbeatMonitor,
    /// Cancels the initial sync stream in flight
    sync_cancel: Option<CancellationToken>,
    /// Live traffic that arrived while the project was being replaced
    held_back: Vec<ControlMessage>,
    resync_recommended: bool,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
}

impl<T: Transport> SessionActor<T> {
    pub(super) fn new(
        config: SyncConfig,
        transport: T,
        store: Arc<dyn ProjectStore>,
        status: watch::Sender<SessionStatus>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (connection, link_events) = ConnectionManager::new(transport, config.clone());
        Self {
            channels: SyncChannelTransport::new(&config),
            link: None,
            outgoing: OutgoingSync::new(),
            incoming: IncomingSync::new(DEFAULT_CHUNK_SIZE, config.max_pending_chunk_bytes),
            broadcaster: OperationBroadcaster::new(
                store,
                DEFAULT_CHUNK_SIZE,
                config.max_pending_chunk_bytes,
            ),
            role: RoleCoordinator::new(config.role_deny_revert(), config.role_request_timeout()),
            heartbeat: HeartbeatMonitor::new(&config),
            sync_cancel: None,
            held_back: Vec::new(),
            resync_recommended: false,
            connection,
            link_events,
            status,
            events,
            config,
        }
    }

    pub(super) fn abort_handle(&self) -> AbortHandle {
        self.connection.abort_handle()
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Session actor started");
        loop {
            let heartbeat_at = self.heartbeat.next_wake();
            let role_at = self.role.next_deadline();

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(event) = self.link_events.recv() => self.on_link_event(event),
                input = next_link_input(&mut self.link) => self.on_link_input(input),
                _ = sleep_until_opt(heartbeat_at) => self.on_heartbeat_tick(),
                _ = sleep_until_opt(role_at) => self.on_role_deadline(),
            }
            self.publish_status();
        }

        self.teardown(false);
        self.connection.disconnect();
        self.publish_status();
        debug!("Session actor stopped");
    }

    /// Publish an event. Status is refreshed first so subscribers never
    /// see an event ahead of the state it implies.
    fn emit(&self, event: SessionEvent) {
        self.publish_status();
        trace!(event = event.name(), "Session event");
        let _ = self.events.send(event);
    }

    fn can_write(&self) -> bool {
        self.connection.state() == ConnectionState::Connected && self.role.can_write()
    }

    fn sync_phase(&self) -> InitialSyncPhase {
        match (self.outgoing.state(), self.incoming.state()) {
            (OutgoingSyncState::AwaitingAccept, _) => InitialSyncPhase::Offered,
            (OutgoingSyncState::Streaming, _) => InitialSyncPhase::Sending,
            (_, IncomingSyncState::AwaitingDecision) => InitialSyncPhase::AwaitingDecision,
            (_, IncomingSyncState::Receiving) => InitialSyncPhase::Receiving,
            (OutgoingSyncState::Complete, _) => InitialSyncPhase::Sent,
            (_, IncomingSyncState::Committed) => InitialSyncPhase::Received,
            _ => InitialSyncPhase::Idle,
        }
    }

    fn publish_status(&self) {
        let next = SessionStatus {
            connection: self.connection.state(),
            reconnection: self.heartbeat.state(),
            role: self.role.state(),
            holds_role: self.role.holds_role(),
            can_write: self.can_write(),
            initial_sync: self.sync_phase(),
            resync_recommended: self.resync_recommended,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    // ----- commands -----

    fn respond<R>(&self, reply: Reply<R>, result: SyncResult<R>) {
        self.publish_status();
        let _ = reply.send(result);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::CreateOffer(reply) => {
                let result = self.create_offer().await;
                self.respond(reply, result);
            }
            Command::AcceptOffer(code, reply) => {
                let result = self.accept_offer(&code).await;
                self.respond(reply, result);
            }
            Command::AcceptAnswer(code, reply) => {
                let result = self.connection.accept_answer(&code);
                self.respond(reply, result);
            }
            Command::Disconnect { graceful, reply } => {
                self.disconnect(graceful);
                self.respond(reply, Ok(()));
            }
            Command::Mutate(mutation, reply) => {
                let result = self.mutate(mutation);
                self.respond(reply, result);
            }
            Command::PushProject(reply) => {
                let result = self.push_project();
                self.respond(reply, result);
            }
            Command::AcceptSync(reply) => {
                let result = self.decide_sync(true, None);
                self.respond(reply, result);
            }
            Command::RejectSync(reason, reply) => {
                let result = self.decide_sync(false, reason);
                self.respond(reply, result);
            }
            Command::RequestRole(reason, reply) => {
                let result = self
                    .role
                    .request(reason, Instant::now())
                    .and_then(|request| self.send(request));
                self.respond(reply, result);
            }
            Command::ApproveRole(reply) => {
                let result = if self.pushing_project() {
                    Err(SyncError::InvalidOperation(
                        "cannot hand over the role while pushing the project".into(),
                    ))
                } else {
                    self.role.approve().and_then(|grant| self.send(grant))
                };
                if result.is_ok() {
                    info!("Writer role granted to peer");
                }
                self.respond(reply, result);
            }
            Command::DenyRole(reason, reply) => {
                let result = self.role.deny(reason).and_then(|deny| self.send(deny));
                self.respond(reply, result);
            }
            Command::SetVisibility { hidden } => {
                debug!(hidden, "Host visibility changed");
                if self.heartbeat.on_visibility(hidden, Instant::now()) == HeartbeatAction::SendPing
                {
                    self.send_ping();
                }
            }
        }
    }

    fn send(&self, message: ControlMessage) -> SyncResult<()> {
        self.channels.send_control(message).map(|_| ())
    }

    /// Fresh channels for a new attempt, if one may start
    fn prepare_handshake(&mut self) {
        if self.connection.state().can_start_handshake() {
            self.channels = SyncChannelTransport::new(&self.config);
            self.resync_recommended = false;
        }
    }

    async fn create_offer(&mut self) -> SyncResult<HandshakePayload> {
        self.prepare_handshake();
        let states = self.connection.subscribe();
        let result = track_states(&self.status, states, self.connection.create_offer()).await;
        if let Err(e) = &result {
            self.emit(SessionEvent::HandshakeFailed {
                error: e.to_string(),
            });
        }
        result
    }

    async fn accept_offer(&mut self, code: &str) -> SyncResult<HandshakePayload> {
        self.prepare_handshake();
        let states = self.connection.subscribe();
        let result = track_states(&self.status, states, self.connection.accept_offer(code)).await;
        if let Err(e) = &result {
            self.emit(SessionEvent::HandshakeFailed {
                error: e.to_string(),
            });
        }
        result
    }

    fn disconnect(&mut self, graceful: bool) {
        if graceful && self.link.is_some() {
            if let Err(e) = self.send(ControlMessage::PeerDisconnect { reason: None }) {
                debug!(error = %e, "Could not announce departure");
            }
        }
        self.teardown(graceful);
        self.connection.disconnect();
        info!(graceful, "Session closed");
    }

    /// Whether our project push is unanswered or still streaming. Until it
    /// ends, the peer's project becomes the push-time snapshot.
    fn pushing_project(&self) -> bool {
        matches!(
            self.outgoing.state(),
            OutgoingSyncState::AwaitingAccept | OutgoingSyncState::Streaming
        )
    }

    /// Whether a local mutation should be broadcast. Without a link it
    /// applies locally only; with a link it needs the writer role.
    fn write_permission(&self, op: &str) -> SyncResult<bool> {
        if !self.connection.state().is_linked() {
            return Ok(false);
        }
        if self.pushing_project() {
            return Err(SyncError::ReadOnly(format!(
                "{} must wait until the project push finishes",
                op
            )));
        }
        if self.can_write() {
            Ok(true)
        } else {
            Err(SyncError::ReadOnly(format!(
                "{} requires the writer role (role is {})",
                op,
                self.role.state()
            )))
        }
    }

    fn mutate(&mut self, mutation: Mutation) -> SyncResult<()> {
        let name = mutation.name();
        let can_write = self.write_permission(name)?;
        let broadcast = match mutation {
            Mutation::Create { card, audio } => {
                self.broadcaster.create_card(card, audio, can_write)?
            }
            Mutation::Update { card_id, changes } => {
                self.broadcaster.update_card(card_id, changes, can_write)?
            }
            Mutation::Delete { card_id } => self.broadcaster.delete_card(card_id, can_write)?,
            Mutation::Reorder { card_order } => self.broadcaster.reorder(card_order, can_write)?,
            Mutation::ChangeAudio {
                card_id,
                audio,
                meta,
            } => {
                let size = audio.len() as u64;
                self.broadcaster
                    .change_audio(card_id, Some(audio), meta, size, can_write)?
            }
        };
        if let Some(broadcast) = broadcast {
            self.dispatch(name, broadcast);
        }
        Ok(())
    }

    /// Send a local operation. Failures are reported, not returned: the
    /// change is already applied locally.
    fn dispatch(&mut self, op: &'static str, broadcast: Broadcast) {
        if let Err(e) = self.send(broadcast.message) {
            self.drop_operation(op, e);
            return;
        }
        if let Some(job) = broadcast.blob {
            if let Err(e) = self.enqueue_job(job) {
                self.drop_operation(op, e);
            }
        }
    }

    fn drop_operation(&mut self, op: &'static str, error: SyncError) {
        warn!(op, error = %error, "Operation not delivered");
        self.resync_recommended = true;
        self.emit(SessionEvent::OperationDropped {
            op,
            error: error.to_string(),
        });
    }

    fn enqueue_job(&mut self, job: StreamJob) -> SyncResult<()> {
        let link = self
            .link
            .as_ref()
            .ok_or(TransportError::NotOpen("binary"))?;
        let cancel = link.cancel.child_token();
        let kind = job.kind;
        link.jobs
            .send(QueuedJob {
                job,
                cancel: cancel.clone(),
            })
            .map_err(|_| TransportError::ChannelClosed("streamer stopped".into()))?;
        if kind == StreamKind::InitialSync {
            self.sync_cancel = Some(cancel);
        }
        Ok(())
    }

    fn push_project(&mut self) -> SyncResult<()> {
        if !self.can_write() {
            return Err(SyncError::ReadOnly(
                "only the connected writer can push its project".into(),
            ));
        }
        let snapshot = self.broadcaster.store().snapshot()?;
        let request = self.outgoing.begin(snapshot)?;
        if let Err(e) = self.send(request) {
            self.outgoing.abort();
            return Err(e);
        }
        Ok(())
    }

    fn decide_sync(&mut self, accept: bool, reason: Option<String>) -> SyncResult<()> {
        let reply = if accept {
            self.incoming.accept()?
        } else {
            self.incoming.reject(reason)?
        };
        info!(accept, "Initial sync decided");
        if let Err(e) = self.send(reply) {
            self.incoming.abort();
            return Err(e);
        }
        Ok(())
    }

    // ----- link lifecycle -----

    fn on_link_event(&mut self, event: LinkEvent) {
        if !self.connection.is_current(&event) {
            debug!(?event, "Ignoring stale link event");
            return;
        }
        match event {
            LinkEvent::Established { link, .. } => self.on_established(link),
            LinkEvent::Failed { error, .. } => {
                self.connection.negotiation_failed(&error);
                self.emit(SessionEvent::HandshakeFailed {
                    error: error.to_string(),
                });
            }
        }
    }

    fn on_established(&mut self, link: LinkPair) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let control = DataChannel::spawn(
            ChannelKind::Control,
            link.control,
            self.config.max_control_frame,
            self.config.buffered_low_threshold,
            events_tx.clone(),
        );
        let binary = DataChannel::spawn(
            ChannelKind::Binary,
            link.binary,
            CHUNK_HEADER_LEN + DEFAULT_CHUNK_SIZE,
            self.config.buffered_low_threshold,
            events_tx,
        );

        self.channels.attach_binary(binary);
        if let Err(e) = self.channels.attach_control(control) {
            self.channels.close();
            self.connection.negotiation_failed(&SyncError::from(e.clone()));
            self.emit(SessionEvent::HandshakeFailed {
                error: e.to_string(),
            });
            return;
        }

        let cancel = CancellationToken::new();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let jobs = spawn_streamer(
            self.channels.clone(),
            self.config.chunk_size,
            cancel.clone(),
            reports_tx,
        );
        let remote = link.remote;
        self.link = Some(ActiveLink {
            remote: remote.clone(),
            events: events_rx,
            reports: reports_rx,
            jobs,
            cancel,
            keepalive: link.keepalive,
        });

        let is_writer = self.connection.is_offerer();
        self.connection.mark_connected();
        self.role.on_connected(is_writer);
        self.heartbeat.start(Instant::now());
        info!(%remote, is_writer, "Session connected");
        self.emit(SessionEvent::Connected { remote, is_writer });
    }

    /// Drop the link and every transfer riding on it
    fn teardown(&mut self, graceful: bool) {
        if let Some(cancel) = self.sync_cancel.take() {
            cancel.cancel();
        }
        match self.link.take() {
            Some(link) => {
                link.cancel.cancel();
                if graceful {
                    self.channels.shutdown();
                    let keepalive = link.keepalive;
                    tokio::spawn(async move {
                        tokio::time::sleep(LINGER).await;
                        drop(keepalive);
                    });
                } else {
                    self.channels.close();
                }
                debug!(remote = %link.remote, graceful, "Link torn down");
            }
            None => self.channels.close(),
        }
        self.heartbeat.stop();
        self.role.on_disconnected();
        self.incoming.abort();
        self.discard_held_back();
        self.outgoing.abort();
        self.broadcaster.reset_incoming();
    }

    /// The link died under us. No renegotiation: the host starts over.
    fn link_failed(&mut self, reason: String) {
        warn!(%reason, "Connection lost");
        self.teardown(false);
        self.connection.mark_failed();
        self.emit(SessionEvent::ConnectionLost { reason });
    }

    fn on_link_input(&mut self, input: LinkInput) {
        match input {
            LinkInput::Channel(Some(ChannelEvent::Frame(kind, frame))) => self.on_frame(kind, frame),
            LinkInput::Channel(Some(ChannelEvent::Closed(kind, reason))) => {
                self.heartbeat.on_channel_closed();
                let reason = match reason {
                    Some(reason) => format!("{} channel failed: {}", kind, reason),
                    None => format!("{} channel closed by peer", kind),
                };
                self.link_failed(reason);
            }
            LinkInput::Channel(None) => {
                self.heartbeat.on_channel_closed();
                self.link_failed("channels ended".into());
            }
            LinkInput::Report(Some(report)) => self.on_stream_report(report),
            LinkInput::Report(None) => {
                self.heartbeat.on_channel_closed();
                self.link_failed("streamer stopped".into());
            }
        }
    }

    fn on_heartbeat_tick(&mut self) {
        match self.heartbeat.on_tick(Instant::now()) {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendPing => self.send_ping(),
            HeartbeatAction::BeginProbing => {
                self.send_ping();
                self.connection.mark_reconnecting();
                self.role.on_suspended();
                self.emit(SessionEvent::Probing);
            }
            HeartbeatAction::PeerLost => self.link_failed("peer stopped answering".into()),
        }
    }

    fn send_ping(&self) {
        if let Err(e) = self.send(ControlMessage::Ping) {
            debug!(error = %e, "Ping not sent");
        }
    }

    fn on_role_deadline(&mut self) {
        match self.role.on_deadline(Instant::now()) {
            Some(RoleTimeout::RequestExpired) => {
                info!("Role request went unanswered");
                self.emit(SessionEvent::RoleRequestExpired);
            }
            Some(RoleTimeout::DenialCleared) => debug!("Role denial cleared"),
            None => {}
        }
    }

    fn on_stream_report(&mut self, report: StreamReport) {
        match report {
            StreamReport::Progress(progress) => self.emit(SessionEvent::UploadProgress(progress)),
            StreamReport::Finished(StreamKind::InitialSync) => {
                self.sync_cancel = None;
                self.outgoing.on_stream_finished();
                self.resync_recommended = false;
                info!("Project sent");
                self.emit(SessionEvent::SyncSent);
            }
            StreamReport::Finished(StreamKind::LiveAudio) => {}
            StreamReport::Failed { kind, error } => {
                let cancelled = matches!(error, SyncError::Transport(TransportError::Cancelled));
                match kind {
                    StreamKind::InitialSync => {
                        self.sync_cancel = None;
                        if cancelled {
                            return;
                        }
                        self.outgoing.abort();
                        let _ = self.send(ControlMessage::SyncError {
                            error: error.to_string(),
                        });
                        self.emit(SessionEvent::SyncFailed {
                            error: error.to_string(),
                        });
                    }
                    StreamKind::LiveAudio => {
                        if !cancelled {
                            self.drop_operation("op_card_audio_change", error);
                        }
                    }
                }
            }
        }
    }

    // ----- inbound traffic -----

    fn on_frame(&mut self, kind: ChannelKind, frame: Bytes) {
        if self.heartbeat.on_alive(Instant::now()) {
            self.connection.mark_recovered();
            self.role.on_resumed();
            self.emit(SessionEvent::Recovered);
        }

        let result = match kind {
            ChannelKind::Control => match Envelope::decode(&frame) {
                Ok(envelope) => {
                    trace!(id = envelope.id, message = envelope.message.name(), "Control message received");
                    self.on_control(envelope.message)
                }
                Err(e) => Err(e.into()),
            },
            ChannelKind::Binary => match ChunkHeader::decode_frame(frame) {
                Ok((header, payload)) => self.on_chunk(header, payload),
                Err(e) => Err(e.into()),
            },
        };

        if let Err(e) = result {
            self.on_handler_error(e);
        }
    }

    fn on_handler_error(&mut self, error: SyncError) {
        if error.is_fatal() {
            self.heartbeat.on_channel_closed();
            self.link_failed(error.to_string());
            return;
        }
        warn!(error = %error, "Dropping inbound message");
        self.emit(SessionEvent::ProtocolError {
            message: error.to_string(),
        });
    }

    /// Writes may only come from the peer holding the role
    fn require_remote_writer(&self, message: &str) -> Result<(), ProtocolError> {
        if self.role.holds_role() {
            return Err(ProtocolError::NotRoleHolder(message.to_string()));
        }
        Ok(())
    }

    fn receiving(&self, message: &str) -> bool {
        if self.incoming.state() == IncomingSyncState::Receiving {
            return true;
        }
        // Leftovers of an abandoned transfer
        trace!(message, "Ignoring initial sync traffic outside a transfer");
        false
    }

    /// Operations and live audio the writer sent after its project. They
    /// belong on top of that project, so they wait for the commit.
    fn hold_back(&mut self, message: ControlMessage) -> Option<ControlMessage> {
        if self.incoming.state() != IncomingSyncState::Receiving || !is_live_traffic(&message) {
            return Some(message);
        }
        if self.held_back.len() >= self.config.control_queue_limit {
            self.drop_operation(
                message.name(),
                TransportError::QueueFull(self.config.control_queue_limit).into(),
            );
            return None;
        }
        trace!(message = message.name(), "Holding live traffic until the project is replaced");
        self.held_back.push(message);
        None
    }

    fn replay_held_back(&mut self) {
        let held = std::mem::take(&mut self.held_back);
        if !held.is_empty() {
            debug!(count = held.len(), "Replaying live traffic on the new project");
        }
        for message in held {
            if let Err(e) = self.on_control(message) {
                self.on_handler_error(e);
            }
        }
    }

    fn discard_held_back(&mut self) {
        if self.held_back.is_empty() {
            return;
        }
        warn!(count = self.held_back.len(), "Discarding live traffic of an abandoned sync");
        self.held_back.clear();
        self.resync_recommended = true;
    }

    fn on_control(&mut self, message: ControlMessage) -> SyncResult<()> {
        let Some(message) = self.hold_back(message) else {
            return Ok(());
        };
        match message {
            ControlMessage::Ping => self.send(ControlMessage::Pong)?,
            ControlMessage::Pong => {}
            ControlMessage::PeerDisconnect { reason } => {
                info!(?reason, "Peer left the session");
                self.teardown(false);
                self.connection.disconnect();
                self.emit(SessionEvent::PeerLeft { reason });
            }

            ControlMessage::SyncRequest {
                project,
                cards,
                total_audio_bytes,
            } => {
                self.require_remote_writer("sync_request")?;
                let pending = self.incoming.on_request(project, cards, total_audio_bytes)?;
                info!(
                    cards = pending.card_count,
                    bytes = pending.total_audio_bytes,
                    "Peer offers its project"
                );
                self.emit(SessionEvent::SyncRequested(pending));
            }
            ControlMessage::SyncAccept { .. } => {
                let job = self.outgoing.on_accept()?;
                info!(records = job.blobs.len(), bytes = job.total_bytes(), "Streaming project");
                if let Err(e) = self.enqueue_job(job) {
                    self.outgoing.abort();
                    return Err(e);
                }
            }
            ControlMessage::SyncReject { reason } => {
                self.outgoing.on_reject()?;
                info!(?reason, "Peer rejected our project");
                self.emit(SessionEvent::SyncRejected { reason });
            }
            ControlMessage::ChunkStart {
                card_id,
                card_index,
                total_chunks,
                audio_size,
            } => {
                if card_index >= LIVE_RECORD_BASE {
                    self.broadcaster
                        .on_chunk_start(card_id, card_index, total_chunks, audio_size)?;
                } else if self.receiving("chunk_start") {
                    let update =
                        self.incoming
                            .on_chunk_start(card_id, card_index, total_chunks, audio_size);
                    self.on_incoming(update)?;
                }
            }
            ControlMessage::ChunkComplete { card_index, .. } => {
                if card_index >= LIVE_RECORD_BASE {
                    self.broadcaster.on_chunk_complete(card_index)?;
                } else if self.receiving("chunk_complete") {
                    let update = self.incoming.on_chunk_complete(card_index);
                    self.on_incoming(update)?;
                }
            }
            ControlMessage::SyncComplete {
                total_cards,
                total_bytes,
            } => {
                if self.receiving("sync_complete") {
                    let update = self.incoming.on_sync_complete(total_cards, total_bytes);
                    self.on_incoming(update)?;
                }
            }
            ControlMessage::SyncError { error } => {
                warn!(%error, "Peer aborted the initial sync");
                if let Some(cancel) = self.sync_cancel.take() {
                    cancel.cancel();
                }
                self.outgoing.abort();
                self.incoming.abort();
                self.discard_held_back();
                self.emit(SessionEvent::SyncFailed { error });
            }

            ControlMessage::RoleRequest { reason } => match self.role.on_request()? {
                None => {
                    info!(?reason, "Peer requests the writer role");
                    self.emit(SessionEvent::RoleRequested { reason });
                }
                Some(deny) => self.send(deny)?,
            },
            ControlMessage::RoleGrant { .. } => {
                let ack = self.role.on_grant()?;
                self.send(ack)?;
                self.role.on_ack_sent();
                info!("Took over the writer role");
                self.emit(SessionEvent::RoleGranted);
            }
            ControlMessage::RoleDeny { reason } => {
                self.role.on_deny(Instant::now())?;
                self.emit(SessionEvent::RoleDenied { reason });
            }
            ControlMessage::RoleTransferComplete { .. } => {
                self.role.on_transfer_complete()?;
                info!("Peer took over the writer role");
                self.emit(SessionEvent::RoleTransferred);
            }

            message => {
                let op = SyncOperation::from_message(&message).ok_or_else(|| {
                    ProtocolError::UnexpectedMessage {
                        message: message.name().to_string(),
                        state: self.connection.state().to_string(),
                    }
                })?;
                let name = op.name();
                self.require_remote_writer(name)?;
                self.broadcaster.apply_remote(op)?;
                self.emit(SessionEvent::RemoteOperation { op: name });
            }
        }
        Ok(())
    }

    fn on_chunk(&mut self, header: ChunkHeader, payload: Bytes) -> SyncResult<()> {
        if header.record_index >= LIVE_RECORD_BASE {
            return self
                .broadcaster
                .on_chunk(header.record_index, header.chunk_index, payload);
        }
        if self.receiving("chunk") {
            let update = self
                .incoming
                .on_chunk(header.record_index, header.chunk_index, payload);
            self.on_incoming(update)?;
        }
        Ok(())
    }

    /// Publish progress and commit, or abandon the transfer on error
    fn on_incoming(&mut self, update: Result<IncomingUpdate, ProtocolError>) -> SyncResult<()> {
        let update = match update {
            Ok(update) => update,
            Err(e) => {
                self.fail_incoming(e.to_string());
                return Err(e.into());
            }
        };
        for progress in update.progress {
            self.emit(SessionEvent::SyncProgress(progress));
        }
        if let Some(snapshot) = update.commit {
            self.commit(snapshot);
        }
        Ok(())
    }

    fn fail_incoming(&mut self, error: String) {
        warn!(%error, "Abandoning initial sync");
        self.incoming.abort();
        self.discard_held_back();
        let _ = self.send(ControlMessage::SyncError {
            error: error.clone(),
        });
        self.emit(SessionEvent::SyncFailed { error });
    }

    fn commit(&mut self, snapshot: ProjectSnapshot) {
        let cards = snapshot.cards.len();
        let bytes = snapshot.total_audio_bytes();
        match self.broadcaster.store().replace_all(snapshot) {
            Ok(()) => {
                self.resync_recommended = false;
                info!(cards, bytes, "Project replaced");
                self.emit(SessionEvent::SyncCompleted { cards, bytes });
                self.replay_held_back();
            }
            Err(e) => self.fail_incoming(e.to_string()),
        }
    }
}

fn is_live_traffic(message: &ControlMessage) -> bool {
    match message {
        ControlMessage::ChunkStart { card_index, .. }
        | ControlMessage::ChunkComplete { card_index, .. } => *card_index >= LIVE_RECORD_BASE,
        message => SyncOperation::from_message(message).is_some(),
    }
}
