//! Liveness monitoring.
//!
//! A ping goes out every `heartbeat_interval`. If a ping is still unanswered
//! when the next one is due, the monitor starts probing: up to
//! `max_probe_attempts` pings `probe_interval` apart. Any inbound traffic
//! restores `stable`; total silence for `pong_timeout` means the peer is gone.
//!
//! ```text
//!  stable ──missed pong──► probing ──pong──► stable
//!                            │
//!                            └──silence ≥ pong_timeout──► peer_disconnected
//!  (any) ──channel closed──► failed
//! ```
//!
//! There is no renegotiation after a loss. Handshake codes cannot be
//! refreshed without the human relay, so the host is told to start over.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SyncConfig;

/// Health of an established link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionState {
    Stable,
    Probing,
    PeerDisconnected,
    Failed,
}

impl ReconnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectionState::Stable => "stable",
            ReconnectionState::Probing => "probing",
            ReconnectionState::PeerDisconnected => "peer_disconnected",
            ReconnectionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReconnectionState::PeerDisconnected | ReconnectionState::Failed
        )
    }
}

impl std::fmt::Display for ReconnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the owner should do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendPing,
    /// A pong was missed: send a probe and treat the link as unhealthy
    BeginProbing,
    /// Silence exceeded the pong timeout
    PeerLost,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    state: ReconnectionState,
    interval: Duration,
    pong_timeout: Duration,
    probe_interval: Duration,
    max_probes: u32,
    last_heard: Instant,
    last_ping: Option<Instant>,
    next_ping_at: Instant,
    probes_sent: u32,
    hidden: bool,
    running: bool,
}

impl HeartbeatMonitor {
    pub fn new(config: &SyncConfig) -> Self {
        let now = Instant::now();
        Self {
            state: ReconnectionState::Stable,
            interval: config.heartbeat_interval(),
            pong_timeout: config.pong_timeout(),
            probe_interval: config.probe_interval(),
            max_probes: config.max_probe_attempts,
            last_heard: now,
            last_ping: None,
            next_ping_at: now,
            probes_sent: 0,
            hidden: false,
            running: false,
        }
    }

    pub fn state(&self) -> ReconnectionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Begin monitoring a fresh link
    pub fn start(&mut self, now: Instant) {
        self.state = ReconnectionState::Stable;
        self.last_heard = now;
        self.last_ping = None;
        self.next_ping_at = now + self.interval;
        self.probes_sent = 0;
        self.running = true;
    }

    /// Stop monitoring without judging the link
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// When the next tick is due, if monitoring
    pub fn next_wake(&self) -> Option<Instant> {
        if !self.running || self.hidden || self.state.is_terminal() {
            return None;
        }
        Some(self.next_ping_at.min(self.last_heard + self.pong_timeout))
    }

    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if !self.running || self.hidden || self.state.is_terminal() {
            return HeartbeatAction::Idle;
        }

        if now.duration_since(self.last_heard) >= self.pong_timeout {
            info!(
                silent_ms = now.duration_since(self.last_heard).as_millis() as u64,
                "Peer stopped answering"
            );
            self.state = ReconnectionState::PeerDisconnected;
            self.running = false;
            return HeartbeatAction::PeerLost;
        }

        if now < self.next_ping_at {
            return HeartbeatAction::Idle;
        }

        match self.state {
            ReconnectionState::Stable => {
                let missed = self.last_ping.is_some_and(|sent| self.last_heard < sent);
                self.last_ping = Some(now);
                if missed {
                    debug!("Pong missed, probing");
                    self.state = ReconnectionState::Probing;
                    self.probes_sent = 1;
                    self.next_ping_at = now + self.probe_interval;
                    HeartbeatAction::BeginProbing
                } else {
                    self.next_ping_at = now + self.interval;
                    HeartbeatAction::SendPing
                }
            }
            ReconnectionState::Probing if self.probes_sent < self.max_probes => {
                self.probes_sent += 1;
                self.last_ping = Some(now);
                self.next_ping_at = now + self.probe_interval;
                debug!(probe = self.probes_sent, "Probing peer");
                HeartbeatAction::SendPing
            }
            _ => {
                // Probes exhausted; only the pong timeout is left to fire
                self.next_ping_at = self.last_heard + self.pong_timeout;
                HeartbeatAction::Idle
            }
        }
    }

    /// Any traffic from the peer proves it is alive.
    ///
    /// Returns true if this ended a probing phase.
    pub fn on_alive(&mut self, now: Instant) -> bool {
        if !self.running {
            return false;
        }
        self.last_heard = now;
        if self.state == ReconnectionState::Probing {
            debug!("Peer answered probe");
            self.state = ReconnectionState::Stable;
            self.probes_sent = 0;
            self.next_ping_at = now + self.interval;
            return true;
        }
        false
    }

    /// Host visibility changed.
    ///
    /// While hidden nothing is judged, since a suspended host cannot tell a
    /// silent peer from its own sleep. Becoming visible grants a fresh grace
    /// period and asks for an immediate ping.
    pub fn on_visibility(&mut self, hidden: bool, now: Instant) -> HeartbeatAction {
        if self.hidden == hidden {
            return HeartbeatAction::Idle;
        }
        self.hidden = hidden;
        if hidden || !self.running || self.state.is_terminal() {
            return HeartbeatAction::Idle;
        }

        self.last_heard = now;
        self.last_ping = Some(now);
        self.next_ping_at = now + self.interval;
        HeartbeatAction::SendPing
    }

    /// The underlying channel ended
    pub fn on_channel_closed(&mut self) {
        self.state = ReconnectionState::Failed;
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (HeartbeatMonitor, Instant) {
        let mut m = HeartbeatMonitor::new(&SyncConfig::default());
        let now = Instant::now();
        m.start(now);
        (m, now)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_pings_on_interval() {
        let (mut m, t0) = monitor();
        assert_eq!(m.on_tick(t0 + secs(1)), HeartbeatAction::Idle);
        assert_eq!(m.on_tick(t0 + secs(5)), HeartbeatAction::SendPing);
        m.on_alive(t0 + secs(5));
        assert_eq!(m.on_tick(t0 + secs(10)), HeartbeatAction::SendPing);
        assert_eq!(m.state(), ReconnectionState::Stable);
    }

    #[test]
    fn test_missed_pong_starts_probing_then_recovers() {
        let (mut m, t0) = monitor();
        assert_eq!(m.on_tick(t0 + secs(5)), HeartbeatAction::SendPing);
        // No pong for the ping at 5s
        assert_eq!(m.on_tick(t0 + secs(10)), HeartbeatAction::BeginProbing);
        assert_eq!(m.state(), ReconnectionState::Probing);
        assert_eq!(m.on_tick(t0 + secs(12)), HeartbeatAction::SendPing);

        assert!(m.on_alive(t0 + secs(13)));
        assert_eq!(m.state(), ReconnectionState::Stable);
    }

    #[test]
    fn test_silence_past_timeout_loses_peer() {
        let (mut m, t0) = monitor();
        m.on_tick(t0 + secs(5));
        m.on_tick(t0 + secs(10));
        m.on_tick(t0 + secs(12));
        m.on_tick(t0 + secs(14));
        // Probes exhausted
        assert_eq!(m.on_tick(t0 + secs(14) + Duration::from_millis(1)), HeartbeatAction::Idle);
        assert_eq!(m.on_tick(t0 + secs(15)), HeartbeatAction::PeerLost);
        assert_eq!(m.state(), ReconnectionState::PeerDisconnected);
        assert_eq!(m.next_wake(), None);
        assert_eq!(m.on_tick(t0 + secs(30)), HeartbeatAction::Idle);
    }

    #[test]
    fn test_hidden_host_is_not_judged() {
        let (mut m, t0) = monitor();
        m.on_visibility(true, t0 + secs(1));
        assert_eq!(m.on_tick(t0 + secs(60)), HeartbeatAction::Idle);
        assert_eq!(m.next_wake(), None);

        // Coming back grants a fresh window and pings at once
        assert_eq!(
            m.on_visibility(false, t0 + secs(61)),
            HeartbeatAction::SendPing
        );
        assert_eq!(m.on_tick(t0 + secs(62)), HeartbeatAction::Idle);
        assert_eq!(m.state(), ReconnectionState::Stable);
    }

    #[test]
    fn test_channel_close_fails() {
        let (mut m, _) = monitor();
        m.on_channel_closed();
        assert_eq!(m.state(), ReconnectionState::Failed);
        assert!(!m.is_running());
    }
}
