//! In-process transport over `tokio::io::duplex` pipes.
//!
//! A [`MemoryNetwork`] plays the role of the network: gathering registers
//! the peer under its node id, dialing looks the remote id up and hands it
//! the far ends of two pipes. Pipe capacity bounds how much data is in
//! flight, so backpressure behaves like a real socket.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{accept_pair, open_pair, ChannelIo, LinkPair, PendingLink, Transport};
use crate::error::{HandshakeError, SyncResult, TransportError};
use crate::signaling::{EndpointInfo, SessionDescription, SessionId};

/// Default capacity of each in-memory pipe
pub const DEFAULT_PIPE_CAPACITY: usize = 32 * 1024;

struct MemoryDial {
    from: [u8; 32],
    streams: [DuplexStream; 2],
}

type Listeners = Arc<Mutex<HashMap<[u8; 32], mpsc::UnboundedSender<MemoryDial>>>>;

/// Shared registry standing in for the network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Listeners,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of peers currently reachable
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Transport for one peer on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    node_id: [u8; 32],
    pipe_capacity: usize,
    reachable: bool,
}

impl MemoryTransport {
    pub fn new(network: &MemoryNetwork) -> Self {
        let mut node_id = [0u8; 32];
        rand::rng().fill_bytes(&mut node_id);
        Self {
            network: network.clone(),
            node_id,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            reachable: true,
        }
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    /// A transport whose gathering never finds a network path
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn node_id(&self) -> [u8; 32] {
        self.node_id
    }
}

impl Transport for MemoryTransport {
    type Pending = MemoryPending;

    async fn gather(&self, session_id: SessionId) -> SyncResult<MemoryPending> {
        if !self.reachable {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.network.listeners.lock().insert(self.node_id, tx);
        debug!(session = %session_id, "Memory endpoint registered");

        Ok(MemoryPending {
            registration: Registration {
                listeners: self.network.listeners.clone(),
                node_id: self.node_id,
            },
            incoming: rx,
            session_id,
            pipe_capacity: self.pipe_capacity,
        })
    }
}

/// Removes the peer from the network when the link goes away
struct Registration {
    listeners: Listeners,
    node_id: [u8; 32],
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.listeners.lock().remove(&self.node_id);
    }
}

/// A registered memory endpoint waiting to connect
pub struct MemoryPending {
    registration: Registration,
    incoming: mpsc::UnboundedReceiver<MemoryDial>,
    session_id: SessionId,
    pipe_capacity: usize,
}

fn split_io(stream: DuplexStream) -> ChannelIo {
    let (reader, writer) = tokio::io::split(stream);
    ChannelIo::new(reader, writer)
}

fn short_label(node_id: &[u8; 32]) -> String {
    node_id[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

impl PendingLink for MemoryPending {
    fn endpoint(&self) -> EndpointInfo {
        EndpointInfo::new(self.registration.node_id)
            .with_address(format!("memory:{}", short_label(&self.registration.node_id)))
    }

    async fn dial(self, remote: SessionDescription) -> SyncResult<LinkPair> {
        let target = self
            .registration
            .listeners
            .lock()
            .get(&remote.endpoint.node_id)
            .cloned()
            .ok_or_else(|| {
                HandshakeError::NetworkUnreachable(format!(
                    "no route to {}",
                    short_label(&remote.endpoint.node_id)
                ))
            })?;

        let (control_near, control_far) = tokio::io::duplex(self.pipe_capacity);
        let (binary_near, binary_far) = tokio::io::duplex(self.pipe_capacity);
        target
            .send(MemoryDial {
                from: self.registration.node_id,
                streams: [control_far, binary_far],
            })
            .map_err(|_| {
                HandshakeError::NetworkUnreachable("remote stopped listening".into())
            })?;

        let (control, binary) = open_pair(
            split_io(control_near),
            split_io(binary_near),
            &self.session_id,
        )
        .await?;

        Ok(LinkPair {
            control,
            binary,
            remote: short_label(&remote.endpoint.node_id),
            keepalive: Box::new(self.registration),
        })
    }

    async fn accept(mut self, remote: SessionDescription) -> SyncResult<LinkPair> {
        loop {
            let dial = self.incoming.recv().await.ok_or_else(|| {
                TransportError::ChannelClosed("memory endpoint closed".into())
            })?;
            if dial.from != remote.endpoint.node_id {
                warn!(from = %short_label(&dial.from), "Ignoring dial from unexpected peer");
                continue;
            }

            let [first, second] = dial.streams;
            let (control, binary) =
                accept_pair(split_io(first), split_io(second), &self.session_id).await?;

            return Ok(LinkPair {
                control,
                binary,
                remote: short_label(&remote.endpoint.node_id),
                keepalive: Box::new(self.registration),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SessionDescription;

    #[tokio::test]
    async fn test_dial_and_accept() {
        let network = MemoryNetwork::new();
        let a = MemoryTransport::new(&network);
        let b = MemoryTransport::new(&network);
        let session = SessionId::new();

        let a_pending = a.gather(session).await.unwrap();
        let offer = SessionDescription::offer(session, a_pending.endpoint());
        let b_pending = b.gather(session).await.unwrap();
        let answer = SessionDescription::answer(session, b_pending.endpoint());
        assert_eq!(network.listener_count(), 2);

        let accept = tokio::spawn(b_pending.accept(offer));
        let a_link = a_pending.dial(answer).await.unwrap();
        let b_link = accept.await.unwrap().unwrap();

        assert_eq!(a_link.remote, short_label(&b.node_id()));
        assert_eq!(b_link.remote, short_label(&a.node_id()));

        drop(a_link);
        drop(b_link);
        assert_eq!(network.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let a = MemoryTransport::new(&network);
        let session = SessionId::new();
        let pending = a.gather(session).await.unwrap();

        let ghost = SessionDescription::answer(session, EndpointInfo::new([9u8; 32]));
        let err = pending.dial(ghost).await.err().unwrap();
        assert!(matches!(
            err,
            crate::SyncError::Handshake(HandshakeError::NetworkUnreachable(_))
        ));
    }
}
