//! Raw transport abstraction
//!
//! A transport turns a pair of handshake descriptions into two reliable,
//! ordered byte streams: the control channel and the binary channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Transport::gather(session_id)                                  │
//! │  └── PendingLink (bound socket + gathered candidates)           │
//! │      ├── dial(answer)    offerer, after the answer is applied   │
//! │      └── accept(offer)   answerer, waits for the offerer        │
//! │                                                                 │
//! │  LinkPair                                                       │
//! │  ├── control: ChannelIo (byte stream)                           │
//! │  └── binary:  ChannelIo (byte stream)                           │
//! │                                                                 │
//! │  DataChannel (channel.rs)                                       │
//! │  └── length-delimited frames + buffered-bytes accounting        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every channel opens with a preamble `CSYN | session_id | tag`, answered
//! with a single ack byte. A channel is ready once the ack is read.

use std::any::Any;
use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HandshakeError, SyncResult, TransportError};
use crate::signaling::{EndpointInfo, SessionDescription, SessionId};

pub mod channel;
pub mod memory;
pub mod quic;

pub use channel::{ChannelEvent, ChannelSender, DataChannel};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use quic::{IrohTransport, CARDSYNC_ALPN};

const PREAMBLE_MAGIC: &[u8; 4] = b"CSYN";
const PREAMBLE_ACK: u8 = 0x06;

/// Boxed read half of a channel stream
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a channel stream
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The two logical channels of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Small structured protocol messages
    Control,
    /// Chunked blob payloads
    Binary,
}

impl ChannelKind {
    fn tag(self) -> u8 {
        match self {
            ChannelKind::Control => 0,
            ChannelKind::Binary => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ChannelKind::Control),
            1 => Some(ChannelKind::Binary),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Control => "control",
            ChannelKind::Binary => "binary",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both halves of one channel's byte stream
pub struct ChannelIo {
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

impl ChannelIo {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// An established link: both channels ready.
pub struct LinkPair {
    pub control: ChannelIo,
    pub binary: ChannelIo,
    /// Short label of the remote peer for logs
    pub remote: String,
    /// Resources that must outlive the channels (connection handles, sockets)
    pub keepalive: Box<dyn Any + Send>,
}

/// Something that can bind local network resources and gather candidates.
pub trait Transport: Send + Sync + 'static {
    type Pending: PendingLink;

    /// Bind and gather every local candidate. Resolves only once gathering
    /// is complete, since a relayed code cannot be amended later.
    fn gather(
        &self,
        session_id: SessionId,
    ) -> impl Future<Output = SyncResult<Self::Pending>> + Send;
}

/// Local side of a handshake between gathering and connection.
pub trait PendingLink: Send + 'static {
    /// The candidates to put into our handshake code
    fn endpoint(&self) -> EndpointInfo;

    /// Offerer: connect to the answering peer and open both channels.
    fn dial(
        self,
        remote: SessionDescription,
    ) -> impl Future<Output = SyncResult<LinkPair>> + Send;

    /// Answerer: wait for the offering peer to open both channels.
    fn accept(
        self,
        remote: SessionDescription,
    ) -> impl Future<Output = SyncResult<LinkPair>> + Send;
}

fn io_err(e: std::io::Error) -> TransportError {
    TransportError::Io(e.to_string())
}

/// Opener side: announce the channel and wait for the ack.
pub(crate) async fn open_channel(
    io: &mut ChannelIo,
    session_id: &SessionId,
    kind: ChannelKind,
) -> SyncResult<()> {
    let mut preamble = Vec::with_capacity(21);
    preamble.extend_from_slice(PREAMBLE_MAGIC);
    preamble.extend_from_slice(session_id.as_bytes());
    preamble.push(kind.tag());
    io.writer.write_all(&preamble).await.map_err(io_err)?;
    io.writer.flush().await.map_err(io_err)?;

    let ack = io.reader.read_u8().await.map_err(io_err)?;
    if ack != PREAMBLE_ACK {
        return Err(TransportError::ChannelClosed(format!("{} channel refused", kind)).into());
    }
    Ok(())
}

/// Acceptor side: read a channel announcement, check it belongs to this
/// session and ack it.
pub(crate) async fn accept_channel(
    io: &mut ChannelIo,
    session_id: &SessionId,
) -> SyncResult<ChannelKind> {
    let mut preamble = [0u8; 21];
    io.reader.read_exact(&mut preamble).await.map_err(io_err)?;

    if &preamble[..4] != PREAMBLE_MAGIC {
        return Err(HandshakeError::MalformedCode("peer sent an unknown preamble".into()).into());
    }
    if preamble[4..20] != session_id.as_bytes()[..] {
        return Err(HandshakeError::MalformedCode(
            "peer connected with a different session id".into(),
        )
        .into());
    }
    let kind = ChannelKind::from_tag(preamble[20]).ok_or_else(|| {
        HandshakeError::MalformedCode(format!("unknown channel tag {}", preamble[20]))
    })?;

    io.writer.write_u8(PREAMBLE_ACK).await.map_err(io_err)?;
    io.writer.flush().await.map_err(io_err)?;
    Ok(kind)
}

/// Announce both channels at once so the acceptor may take them in any order.
pub(crate) async fn open_pair(
    mut control: ChannelIo,
    mut binary: ChannelIo,
    session_id: &SessionId,
) -> SyncResult<(ChannelIo, ChannelIo)> {
    tokio::try_join!(
        open_channel(&mut control, session_id, ChannelKind::Control),
        open_channel(&mut binary, session_id, ChannelKind::Binary),
    )?;
    Ok((control, binary))
}

/// Accept two announced channels in either order and sort them.
pub(crate) async fn accept_pair(
    mut first: ChannelIo,
    mut second: ChannelIo,
    session_id: &SessionId,
) -> SyncResult<(ChannelIo, ChannelIo)> {
    let first_kind = accept_channel(&mut first, session_id).await?;
    let second_kind = accept_channel(&mut second, session_id).await?;
    match (first_kind, second_kind) {
        (ChannelKind::Control, ChannelKind::Binary) => Ok((first, second)),
        (ChannelKind::Binary, ChannelKind::Control) => Ok((second, first)),
        (kind, _) => Err(HandshakeError::MalformedCode(format!(
            "peer opened two {} channels",
            kind
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duplex_pair() -> (ChannelIo, ChannelIo) {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (ChannelIo::new(ar, aw), ChannelIo::new(br, bw))
    }

    #[tokio::test]
    async fn test_preamble_handshake() {
        let session = SessionId::new();
        let (mut opener, mut acceptor) = duplex_pair();

        let accept = tokio::spawn(async move {
            let kind = accept_channel(&mut acceptor, &session).await.unwrap();
            (kind, acceptor)
        });
        open_channel(&mut opener, &session, ChannelKind::Binary)
            .await
            .unwrap();
        let (kind, _) = accept.await.unwrap();
        assert_eq!(kind, ChannelKind::Binary);
    }

    #[tokio::test]
    async fn test_preamble_rejects_foreign_session() {
        let (mut opener, mut acceptor) = duplex_pair();
        let theirs = SessionId::new();
        let ours = SessionId::new();

        let accept = tokio::spawn(async move { accept_channel(&mut acceptor, &ours).await });
        // The acceptor drops its end on failure, so the opener sees EOF
        let opened = open_channel(&mut opener, &theirs, ChannelKind::Control).await;
        assert!(accept.await.unwrap().is_err());
        assert!(opened.is_err());
    }

    #[tokio::test]
    async fn test_accept_pair_sorts_channels() {
        let session = SessionId::new();
        let (mut bin_open, bin_accept) = duplex_pair();
        let (mut ctl_open, ctl_accept) = duplex_pair();

        let opener = tokio::spawn(async move {
            open_channel(&mut bin_open, &session, ChannelKind::Binary).await?;
            open_channel(&mut ctl_open, &session, ChannelKind::Control).await?;
            SyncResult::Ok((ctl_open, bin_open))
        });

        let (mut control, _binary) = accept_pair(bin_accept, ctl_accept, &session)
            .await
            .unwrap();
        let (mut ctl_open, _) = opener.await.unwrap().unwrap();

        ctl_open.writer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        control.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
