//! Single-writer role handoff.
//!
//! Exactly one connected peer holds the writer role. Handing it over takes
//! two messages so there is never a moment where both peers may write:
//!
//! ```text
//!  writer (A)                               viewer (B)
//!  idle                                     idle
//!                    ◄── role_request ───   pending_request
//!  pending_approval
//!  approve():
//!  transferring      ─── role_grant ────►   transferring
//!  (can_write=false) ◄── role_transfer_complete
//!                                           idle, writer (ack sent)
//!  idle, viewer
//! ```
//!
//! Neither side may write while it is `transferring`. The requester only
//! takes the role once its acknowledgement is on the wire, so the grantor
//! may still show `transferring` after the requester became the writer.
//!
//! [`RoleCoordinator`] is a pure state machine. It never sends anything
//! itself; callers transmit the returned messages and drive the deadline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{ProtocolError, SyncError, SyncResult};
use crate::protocol::ControlMessage;

/// Progress of a role handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleTransferState {
    Idle,
    /// We asked the writer for the role
    PendingRequest,
    /// The peer asked us for the role; the host must decide
    PendingApproval,
    /// We granted the role and wait for the peer to take it, or we were
    /// granted it and have not acknowledged yet
    Transferring,
    /// Our request was denied; reverts to idle shortly
    Denied,
}

impl RoleTransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleTransferState::Idle => "idle",
            RoleTransferState::PendingRequest => "pending_request",
            RoleTransferState::PendingApproval => "pending_approval",
            RoleTransferState::Transferring => "transferring",
            RoleTransferState::Denied => "denied",
        }
    }
}

impl std::fmt::Display for RoleTransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened when a deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleTimeout {
    /// `denied` reverted to `idle`
    DenialCleared,
    /// The writer never answered our request
    RequestExpired,
}

/// Tracks which peer may write and runs the handoff handshake
#[derive(Debug)]
pub struct RoleCoordinator {
    state: RoleTransferState,
    holds_role: bool,
    connected: bool,
    deadline: Option<Instant>,
    deny_revert: Duration,
    request_timeout: Duration,
}

impl RoleCoordinator {
    pub fn new(deny_revert: Duration, request_timeout: Duration) -> Self {
        Self {
            state: RoleTransferState::Idle,
            holds_role: false,
            connected: false,
            deadline: None,
            deny_revert,
            request_timeout,
        }
    }

    pub fn state(&self) -> RoleTransferState {
        self.state
    }

    /// Whether this peer is the writer, transfer or not
    pub fn holds_role(&self) -> bool {
        self.holds_role
    }

    /// The single write predicate: connected, holding the role, and not
    /// in the middle of handing it over.
    pub fn can_write(&self) -> bool {
        self.connected && self.holds_role && self.state != RoleTransferState::Transferring
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A link came up. The offerer starts as the writer.
    pub fn on_connected(&mut self, is_writer: bool) {
        self.connected = true;
        self.holds_role = is_writer;
        self.state = RoleTransferState::Idle;
        self.deadline = None;
    }

    /// Liveness is in doubt; writes stop until it returns
    pub fn on_suspended(&mut self) {
        self.connected = false;
    }

    pub fn on_resumed(&mut self) {
        self.connected = true;
    }

    /// The link is gone. Any handoff in flight is abandoned.
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.state = RoleTransferState::Idle;
        self.deadline = None;
    }

    fn wrong_state(&self, op: &str) -> SyncError {
        SyncError::InvalidOperation(format!("cannot {} while role is {}", op, self.state))
    }

    fn unexpected(&self, message: &str) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            message: message.to_string(),
            state: self.state.to_string(),
        }
    }

    /// Ask the writer for the role.
    pub fn request(&mut self, reason: Option<String>, now: Instant) -> SyncResult<ControlMessage> {
        if !self.connected {
            return Err(SyncError::InvalidOperation("not connected".into()));
        }
        if self.holds_role {
            return Err(SyncError::InvalidOperation("already the writer".into()));
        }
        if self.state != RoleTransferState::Idle {
            return Err(self.wrong_state("request the role"));
        }
        self.state = RoleTransferState::PendingRequest;
        self.deadline = Some(now + self.request_timeout);
        Ok(ControlMessage::RoleRequest { reason })
    }

    /// The peer asked for the role.
    ///
    /// Returns `Ok(None)` when the host must decide, or an immediate
    /// `role_deny` when a decision is already pending.
    pub fn on_request(&mut self) -> Result<Option<ControlMessage>, ProtocolError> {
        if !self.holds_role {
            return Err(self.unexpected("role_request"));
        }
        match self.state {
            RoleTransferState::Idle => {
                self.state = RoleTransferState::PendingApproval;
                Ok(None)
            }
            _ => Ok(Some(ControlMessage::RoleDeny {
                reason: Some(format!("role is {}", self.state)),
            })),
        }
    }

    /// Host approved the pending request. Our writes stop here.
    pub fn approve(&mut self) -> SyncResult<ControlMessage> {
        if self.state != RoleTransferState::PendingApproval {
            return Err(self.wrong_state("approve"));
        }
        self.state = RoleTransferState::Transferring;
        Ok(ControlMessage::RoleGrant { reason: None })
    }

    /// Host denied the pending request.
    pub fn deny(&mut self, reason: Option<String>) -> SyncResult<ControlMessage> {
        if self.state != RoleTransferState::PendingApproval {
            return Err(self.wrong_state("deny"));
        }
        self.state = RoleTransferState::Idle;
        Ok(ControlMessage::RoleDeny { reason })
    }

    /// The writer granted our request. Returns the acknowledgement; the
    /// role is ours once it has been sent, see [`Self::on_ack_sent`].
    pub fn on_grant(&mut self) -> Result<ControlMessage, ProtocolError> {
        if self.state != RoleTransferState::PendingRequest {
            return Err(self.unexpected("role_grant"));
        }
        self.state = RoleTransferState::Transferring;
        self.deadline = None;
        Ok(ControlMessage::RoleTransferComplete { reason: None })
    }

    /// Our `role_transfer_complete` went out. We are the writer now.
    pub fn on_ack_sent(&mut self) {
        if self.state == RoleTransferState::Transferring && !self.holds_role {
            self.holds_role = true;
            self.state = RoleTransferState::Idle;
        }
    }

    /// The writer refused our request.
    pub fn on_deny(&mut self, now: Instant) -> Result<(), ProtocolError> {
        if self.state != RoleTransferState::PendingRequest {
            return Err(self.unexpected("role_deny"));
        }
        self.state = RoleTransferState::Denied;
        self.deadline = Some(now + self.deny_revert);
        Ok(())
    }

    /// The peer took the role we granted.
    pub fn on_transfer_complete(&mut self) -> Result<(), ProtocolError> {
        if self.state != RoleTransferState::Transferring || !self.holds_role {
            return Err(self.unexpected("role_transfer_complete"));
        }
        self.holds_role = false;
        self.state = RoleTransferState::Idle;
        Ok(())
    }

    /// Fire the pending deadline if it is due.
    pub fn on_deadline(&mut self, now: Instant) -> Option<RoleTimeout> {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return None,
        }
        self.deadline = None;
        match self.state {
            RoleTransferState::Denied => {
                self.state = RoleTransferState::Idle;
                Some(RoleTimeout::DenialCleared)
            }
            RoleTransferState::PendingRequest => {
                self.state = RoleTransferState::Idle;
                Some(RoleTimeout::RequestExpired)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> RoleCoordinator {
        RoleCoordinator::new(Duration::from_secs(3), Duration::from_secs(30))
    }

    fn connected_pair() -> (RoleCoordinator, RoleCoordinator) {
        let mut writer = coordinator();
        let mut viewer = coordinator();
        writer.on_connected(true);
        viewer.on_connected(false);
        (writer, viewer)
    }

    fn writers(a: &RoleCoordinator, b: &RoleCoordinator) -> usize {
        [a, b].iter().filter(|c| c.can_write()).count()
    }

    #[test]
    fn test_nobody_writes_while_disconnected() {
        let mut c = coordinator();
        assert!(!c.can_write());
        c.on_connected(true);
        assert!(c.can_write());
        c.on_disconnected();
        assert!(!c.can_write());
    }

    #[test]
    fn test_handoff_never_has_two_writers() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair();
        assert_eq!(writers(&a, &b), 1);

        let request = b.request(None, now).unwrap();
        assert_eq!(request, ControlMessage::RoleRequest { reason: None });
        assert_eq!(b.state(), RoleTransferState::PendingRequest);
        assert_eq!(writers(&a, &b), 1);

        assert_eq!(a.on_request().unwrap(), None);
        assert_eq!(a.state(), RoleTransferState::PendingApproval);
        assert!(a.can_write());

        let grant = a.approve().unwrap();
        assert_eq!(grant, ControlMessage::RoleGrant { reason: None });
        assert_eq!(a.state(), RoleTransferState::Transferring);
        assert_eq!(writers(&a, &b), 0);

        let complete = b.on_grant().unwrap();
        assert_eq!(
            complete,
            ControlMessage::RoleTransferComplete { reason: None }
        );
        // Both sides are transferring and neither writes
        assert_eq!(b.state(), RoleTransferState::Transferring);
        assert!(!b.holds_role());
        assert_eq!(writers(&a, &b), 0);

        // A peer mid-handoff refuses a second grant or a stray ack
        assert!(b.on_grant().is_err());
        assert!(b.on_transfer_complete().is_err());

        b.on_ack_sent();
        assert_eq!(b.state(), RoleTransferState::Idle);
        assert!(b.holds_role());
        // A has not seen the ack yet; B is the only writer
        assert_eq!(writers(&a, &b), 1);
        assert!(b.can_write());

        a.on_transfer_complete().unwrap();
        assert_eq!(a.state(), RoleTransferState::Idle);
        assert!(!a.holds_role());
        assert_eq!(writers(&a, &b), 1);
    }

    #[test]
    fn test_denied_reverts_after_delay() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair();
        b.request(Some("my turn".into()), now).unwrap();
        a.on_request().unwrap();
        let deny = a.deny(Some("not now".into())).unwrap();
        assert_eq!(
            deny,
            ControlMessage::RoleDeny {
                reason: Some("not now".into())
            }
        );
        assert!(a.can_write());

        b.on_deny(now).unwrap();
        assert_eq!(b.state(), RoleTransferState::Denied);
        assert!(!b.can_write());

        assert_eq!(b.on_deadline(now + Duration::from_secs(1)), None);
        assert_eq!(
            b.on_deadline(now + Duration::from_secs(3)),
            Some(RoleTimeout::DenialCleared)
        );
        assert_eq!(b.state(), RoleTransferState::Idle);
        assert!(!b.can_write());
    }

    #[test]
    fn test_unanswered_request_expires() {
        let now = Instant::now();
        let (_, mut b) = connected_pair();
        b.request(None, now).unwrap();
        assert_eq!(
            b.on_deadline(now + Duration::from_secs(30)),
            Some(RoleTimeout::RequestExpired)
        );
        assert_eq!(b.state(), RoleTransferState::Idle);
    }

    #[test]
    fn test_second_request_is_auto_denied() {
        let (mut a, _) = connected_pair();
        assert_eq!(a.on_request().unwrap(), None);
        assert!(matches!(
            a.on_request().unwrap(),
            Some(ControlMessage::RoleDeny { .. })
        ));
        assert_eq!(a.state(), RoleTransferState::PendingApproval);
    }

    #[test]
    fn test_out_of_step_messages_are_protocol_errors() {
        let (mut a, mut b) = connected_pair();
        assert!(b.on_request().is_err());
        assert!(a.on_grant().is_err());
        assert!(a.on_deny(Instant::now()).is_err());
        assert!(a.on_transfer_complete().is_err());
        assert!(a.request(None, Instant::now()).is_err());
    }

    #[test]
    fn test_disconnect_abandons_handoff() {
        let (mut a, mut b) = connected_pair();
        b.request(None, Instant::now()).unwrap();
        a.on_request().unwrap();
        a.approve().unwrap();
        a.on_disconnected();
        b.on_disconnected();
        assert_eq!(a.state(), RoleTransferState::Idle);
        assert_eq!(b.state(), RoleTransferState::Idle);
        assert_eq!(b.next_deadline(), None);
        assert_eq!(writers(&a, &b), 0);
    }
}
