//! QUIC transport on iroh
//!
//! Each session binds a fresh endpoint with relays disabled, so peers only
//! ever talk over direct addresses. The offerer dials the answerer once the
//! answer code is applied and opens one bidirectional stream per logical
//! channel. Incoming connections reach the answerer through a [`Router`]
//! registered for [`CARDSYNC_ALPN`].

use std::net::SocketAddr;
use std::time::Duration;

use iroh::endpoint::Connection;
use iroh::protocol::{ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, PublicKey, RelayMode, SecretKey};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{accept_pair, open_pair, ChannelIo, LinkPair, PendingLink, Transport};
use crate::error::{HandshakeError, SyncResult, TransportError};
use crate::signaling::{EndpointInfo, SessionDescription, SessionId};

/// ALPN identifier for cardsync sessions
pub const CARDSYNC_ALPN: &[u8] = b"cardsync/1";

/// How often gathering re-checks the endpoint for direct addresses
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Transport over iroh QUIC connections
#[derive(Debug, Clone, Default)]
pub struct IrohTransport {
    secret_key: Option<SecretKey>,
}

impl IrohTransport {
    /// A transport that generates a fresh identity for every session
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that always binds with the given identity
    pub fn with_secret_key(secret_key: SecretKey) -> Self {
        Self {
            secret_key: Some(secret_key),
        }
    }
}

impl Transport for IrohTransport {
    type Pending = IrohPending;

    async fn gather(&self, session_id: SessionId) -> SyncResult<IrohPending> {
        let secret_key = self
            .secret_key
            .clone()
            .unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![CARDSYNC_ALPN.to_vec()])
            .relay_mode(RelayMode::Disabled)
            .bind()
            .await
            .map_err(|e| {
                HandshakeError::NetworkUnreachable(format!("Failed to bind endpoint: {}", e))
            })?;

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let router = Router::builder(endpoint.clone())
            .accept(CARDSYNC_ALPN, LinkAcceptor { conn_tx })
            .spawn();

        // Codes cannot be amended after they are shared, so wait until the
        // endpoint knows at least one direct address.
        let addr = loop {
            let addr = endpoint.addr();
            if addr.ip_addrs().next().is_some() {
                break addr;
            }
            tokio::time::sleep(ADDRESS_POLL_INTERVAL).await;
        };

        let info = EndpointInfo::new(addr.id.as_bytes().to_owned())
            .with_addresses(addr.ip_addrs().map(|a| a.to_string()));
        info!(
            endpoint = %endpoint.id(),
            addresses = info.direct_addresses.len(),
            "Endpoint bound"
        );

        Ok(IrohPending {
            endpoint,
            router,
            incoming: conn_rx,
            session_id,
            info,
        })
    }
}

/// Forwards incoming cardsync connections to the waiting answerer
#[derive(Debug, Clone)]
struct LinkAcceptor {
    conn_tx: mpsc::UnboundedSender<Connection>,
}

impl ProtocolHandler for LinkAcceptor {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let conn_tx = self.conn_tx.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting cardsync connection");
            if conn_tx.send(conn).is_err() {
                debug!("No session waiting for connections");
            }
            Ok(())
        }
    }
}

/// A bound endpoint waiting to connect
pub struct IrohPending {
    endpoint: Endpoint,
    router: Router,
    incoming: mpsc::UnboundedReceiver<Connection>,
    session_id: SessionId,
    info: EndpointInfo,
}

/// Everything that must stay alive for the streams to keep flowing
struct QuicLink {
    _conn: Connection,
    _router: Router,
    _endpoint: Endpoint,
}

fn remote_addr(info: &EndpointInfo) -> SyncResult<EndpointAddr> {
    let public_key = PublicKey::from_bytes(&info.node_id)
        .map_err(|e| HandshakeError::MalformedCode(format!("Invalid public key: {}", e)))?;

    let mut addr = EndpointAddr::new(public_key);
    for addr_str in &info.direct_addresses {
        let socket_addr: SocketAddr = addr_str.parse().map_err(|e| {
            HandshakeError::MalformedCode(format!("Invalid socket address: {}", e))
        })?;
        addr = addr.with_ip_addr(socket_addr);
    }
    Ok(addr)
}

fn short_id(conn: &Connection) -> String {
    conn.remote_id().to_string().chars().take(10).collect()
}

impl PendingLink for IrohPending {
    fn endpoint(&self) -> EndpointInfo {
        self.info.clone()
    }

    async fn dial(self, remote: SessionDescription) -> SyncResult<LinkPair> {
        let addr = remote_addr(&remote.endpoint)?;
        debug!(peer = %addr.id, "Dialing answerer");

        let conn = self
            .endpoint
            .connect(addr, CARDSYNC_ALPN)
            .await
            .map_err(|e| HandshakeError::NetworkUnreachable(format!("Failed to connect: {}", e)))?;

        let (control_send, control_recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Io(format!("Failed to open bi stream: {}", e)))?;
        let (binary_send, binary_recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Io(format!("Failed to open bi stream: {}", e)))?;

        let (control, binary) = open_pair(
            ChannelIo::new(control_recv, control_send),
            ChannelIo::new(binary_recv, binary_send),
            &self.session_id,
        )
        .await?;

        let remote = short_id(&conn);
        info!(peer = %remote, "Link established");
        Ok(LinkPair {
            control,
            binary,
            remote,
            keepalive: Box::new(QuicLink {
                _conn: conn,
                _router: self.router,
                _endpoint: self.endpoint,
            }),
        })
    }

    async fn accept(mut self, remote: SessionDescription) -> SyncResult<LinkPair> {
        loop {
            let conn = self
                .incoming
                .recv()
                .await
                .ok_or_else(|| TransportError::ChannelClosed("endpoint closed".into()))?;

            if conn.remote_id().as_bytes() != &remote.endpoint.node_id {
                warn!(peer = %conn.remote_id(), "Ignoring connection from unexpected peer");
                continue;
            }

            // The offerer writes both preambles up front, so each accept_bi
            // resolves without waiting on our acks.
            let (first_send, first_recv) = conn
                .accept_bi()
                .await
                .map_err(|e| TransportError::Io(format!("Failed to accept bi stream: {}", e)))?;
            let (second_send, second_recv) = conn
                .accept_bi()
                .await
                .map_err(|e| TransportError::Io(format!("Failed to accept bi stream: {}", e)))?;

            let (control, binary) = accept_pair(
                ChannelIo::new(first_recv, first_send),
                ChannelIo::new(second_recv, second_send),
                &self.session_id,
            )
            .await?;

            let remote = short_id(&conn);
            info!(peer = %remote, "Link established");
            return Ok(LinkPair {
                control,
                binary,
                remote,
                keepalive: Box::new(QuicLink {
                    _conn: conn,
                    _router: self.router,
                    _endpoint: self.endpoint,
                }),
            });
        }
    }
}
