//! Framed data channel with buffered-bytes accounting.
//!
//! Each channel owns a writer task and a reader task. Frames queued with
//! [`ChannelSender::send`] count towards the channel's buffered amount until
//! the writer task has handed them to the stream; senders can wait for that
//! amount to fall below a threshold, which is how chunk streaming applies
//! backpressure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{BoxReader, BoxWriter, ChannelIo, ChannelKind};
use crate::error::TransportError;

/// Inbound traffic from either channel, in arrival order per channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A complete frame
    Frame(ChannelKind, Bytes),
    /// The channel ended; `None` for a clean end of stream
    Closed(ChannelKind, Option<String>),
}

enum WriterCmd {
    Frame(Bytes),
    /// Flush everything queued so far, then end the stream
    Shutdown,
}

struct ChannelShared {
    kind: ChannelKind,
    buffered: AtomicUsize,
    low_threshold: usize,
    low: Notify,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl ChannelShared {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.low.notify_waiters();
    }
}

/// Cloneable sending half of a data channel
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<WriterCmd>,
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("kind", &self.shared.kind)
            .field("buffered", &self.buffered_amount())
            .field("open", &self.is_open())
            .finish()
    }
}

impl ChannelSender {
    pub fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    /// Whether the channel still accepts frames
    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    /// Bytes queued but not yet handed to the stream
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    /// Queue a frame. Never blocks; use [`wait_buffered_low`](Self::wait_buffered_low)
    /// to pace large transfers.
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen(self.shared.kind.as_str()));
        }
        let len = frame.len();
        self.shared.buffered.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(WriterCmd::Frame(frame)).is_err() {
            self.shared.buffered.fetch_sub(len, Ordering::SeqCst);
            self.shared.mark_closed();
            return Err(TransportError::NotOpen(self.shared.kind.as_str()));
        }
        Ok(())
    }

    /// Suspend until the buffered amount is at or below the low threshold.
    ///
    /// Resolves with `Cancelled` as soon as the channel closes, so no waiter
    /// outlives the connection.
    pub async fn wait_buffered_low(&self) -> Result<(), TransportError> {
        loop {
            let notified = self.shared.low.notified();
            if !self.is_open() {
                return Err(TransportError::Cancelled);
            }
            if self.buffered_amount() <= self.shared.low_threshold {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Stop accepting frames, flush what is queued, then end the stream.
    pub fn shutdown(&self) {
        if self.is_open() {
            let _ = self.tx.send(WriterCmd::Shutdown);
        }
        self.shared.mark_closed();
    }

    /// Tear the channel down immediately, discarding queued frames.
    pub fn close(&self) {
        self.shared.mark_closed();
        self.shared.cancel.cancel();
    }
}

/// Builds data channels over established byte streams.
pub struct DataChannel;

impl DataChannel {
    /// Start the reader and writer tasks for one channel.
    ///
    /// Inbound frames and the final close are delivered to `events`.
    pub fn spawn(
        kind: ChannelKind,
        io: ChannelIo,
        max_frame: usize,
        low_threshold: usize,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ChannelSender {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            kind,
            buffered: AtomicUsize::new(0),
            low_threshold,
            low: Notify::new(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(max_frame)
                .new_codec()
        };

        tokio::spawn(run_writer(
            FramedWrite::new(io.writer, codec()),
            rx,
            shared.clone(),
        ));
        tokio::spawn(run_reader(
            FramedRead::new(io.reader, codec()),
            events,
            shared.clone(),
        ));

        debug!(channel = %kind, "Data channel open");
        ChannelSender { tx, shared }
    }
}

async fn run_writer(
    mut sink: FramedWrite<BoxWriter, LengthDelimitedCodec>,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
    shared: Arc<ChannelShared>,
) {
    loop {
        let cmd = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            cmd = rx.recv() => cmd,
        };

        match cmd {
            Some(WriterCmd::Frame(frame)) => {
                let len = frame.len();
                let result = tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    result = sink.send(frame) => result,
                };
                let remaining = shared.buffered.fetch_sub(len, Ordering::SeqCst) - len;
                if remaining <= shared.low_threshold {
                    shared.low.notify_waiters();
                }
                trace!(channel = %shared.kind, len, remaining, "Frame written");
                if let Err(e) = result {
                    warn!(channel = %shared.kind, error = %e, "Write failed");
                    shared.mark_closed();
                    shared.cancel.cancel();
                    break;
                }
            }
            Some(WriterCmd::Shutdown) | None => {
                let _ = SinkExt::<Bytes>::close(&mut sink).await;
                debug!(channel = %shared.kind, "Writer shut down");
                break;
            }
        }
    }
    shared.mark_closed();
}

async fn run_reader(
    mut stream: FramedRead<BoxReader, LengthDelimitedCodec>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    shared: Arc<ChannelShared>,
) {
    let kind = shared.kind;
    let reason = loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                if events.send(ChannelEvent::Frame(kind, frame.freeze())).is_err() {
                    return;
                }
            }
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }
    };

    debug!(channel = %kind, ?reason, "Reader finished");
    shared.mark_closed();
    let _ = events.send(ChannelEvent::Closed(kind, reason));
}
