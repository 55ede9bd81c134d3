//! Message-level view of the two data channels.
//!
//! [`SyncChannelTransport`] is what every protocol layer talks to. It stamps
//! control messages with an id and timestamp, holds them in a bounded FIFO
//! until the control channel opens, and frames binary chunks with their
//! 8-byte header. Chunk sends suspend while the binary channel has more than
//! the high-water mark outstanding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::SyncConfig;
use crate::error::{SyncResult, TransportError};
use crate::protocol::{ChunkHeader, ControlMessage, Envelope};
use crate::transport::ChannelSender;
use crate::types::now_millis;

enum ControlState {
    /// Channel not open yet; messages wait here in send order
    Pending(VecDeque<Bytes>),
    Open(ChannelSender),
    Closed,
}

struct Inner {
    control: Mutex<ControlState>,
    binary: Mutex<Option<ChannelSender>>,
    next_id: AtomicU64,
    queue_limit: usize,
    max_control_frame: usize,
    high_water_mark: usize,
}

/// Cloneable handle over the control and binary channels of one session
#[derive(Clone)]
pub struct SyncChannelTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncChannelTransport")
            .field("control_open", &self.control_open())
            .field("binary_open", &self.binary_open())
            .finish()
    }
}

impl SyncChannelTransport {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                control: Mutex::new(ControlState::Pending(VecDeque::new())),
                binary: Mutex::new(None),
                next_id: AtomicU64::new(1),
                queue_limit: config.control_queue_limit,
                max_control_frame: config.max_control_frame,
                high_water_mark: config.high_water_mark,
            }),
        }
    }

    /// Hand over the opened control channel and flush queued messages in order.
    pub fn attach_control(&self, sender: ChannelSender) -> Result<(), TransportError> {
        let mut state = self.inner.control.lock();
        let queued = match std::mem::replace(&mut *state, ControlState::Closed) {
            ControlState::Pending(queue) => queue,
            ControlState::Open(_) | ControlState::Closed => VecDeque::new(),
        };
        let count = queued.len();
        for frame in queued {
            sender.send(frame)?;
        }
        if count > 0 {
            debug!(count, "Flushed queued control messages");
        }
        *state = ControlState::Open(sender);
        Ok(())
    }

    pub fn attach_binary(&self, sender: ChannelSender) {
        *self.inner.binary.lock() = Some(sender);
    }

    pub fn control_open(&self) -> bool {
        matches!(&*self.inner.control.lock(), ControlState::Open(s) if s.is_open())
    }

    pub fn binary_open(&self) -> bool {
        self.inner
            .binary
            .lock()
            .as_ref()
            .is_some_and(|s| s.is_open())
    }

    /// Both channels ready
    pub fn is_open(&self) -> bool {
        self.control_open() && self.binary_open()
    }

    /// Control messages waiting for the channel to open
    pub fn queued_len(&self) -> usize {
        match &*self.inner.control.lock() {
            ControlState::Pending(queue) => queue.len(),
            _ => 0,
        }
    }

    /// Bytes outstanding on the binary channel
    pub fn binary_buffered(&self) -> usize {
        self.inner
            .binary
            .lock()
            .as_ref()
            .map(|s| s.buffered_amount())
            .unwrap_or(0)
    }

    /// Serialize and send a control message, queueing it if the channel
    /// has not opened yet. Returns the message id.
    ///
    /// A message whose frame exceeds `max_control_frame` is refused with
    /// `FrameTooLarge`; the peer's reader would otherwise drop the link.
    pub fn send_control(&self, message: ControlMessage) -> SyncResult<u64> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let name = message.name();
        let frame = Envelope {
            message,
            timestamp: now_millis(),
            id,
        }
        .encode()?;
        if frame.len() > self.inner.max_control_frame {
            warn!(id, message = name, len = frame.len(), "Control message too large to send");
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.inner.max_control_frame,
            }
            .into());
        }

        let mut state = self.inner.control.lock();
        match &mut *state {
            ControlState::Open(sender) => {
                sender.send(frame)?;
                trace!(id, message = name, "Control message sent");
            }
            ControlState::Pending(queue) => {
                if queue.len() >= self.inner.queue_limit {
                    return Err(TransportError::QueueFull(self.inner.queue_limit).into());
                }
                queue.push_back(frame);
                trace!(id, message = name, queued = queue.len(), "Control message queued");
            }
            ControlState::Closed => return Err(TransportError::NotOpen("control").into()),
        }
        Ok(id)
    }

    /// Send one chunk on the binary channel.
    ///
    /// Suspends first while the channel's buffered amount exceeds the
    /// high-water mark; resolves with `Cancelled` if the channel closes
    /// during that wait.
    pub async fn send_binary_chunk(
        &self,
        record_index: u32,
        chunk_index: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let sender = self
            .inner
            .binary
            .lock()
            .clone()
            .ok_or(TransportError::NotOpen("binary"))?;

        if sender.buffered_amount() > self.inner.high_water_mark {
            trace!(
                buffered = sender.buffered_amount(),
                "Binary channel above high-water mark, waiting"
            );
            sender.wait_buffered_low().await?;
        }

        sender.send(ChunkHeader::new(record_index, chunk_index).encode_frame(payload))
    }

    /// Flush whatever is queued on both channels, then end them.
    pub fn shutdown(&self) {
        let state = std::mem::replace(&mut *self.inner.control.lock(), ControlState::Closed);
        if let ControlState::Open(sender) = state {
            sender.shutdown();
        }
        if let Some(sender) = self.inner.binary.lock().take() {
            sender.shutdown();
        }
    }

    /// Tear both channels down now. Suspended chunk sends resolve with
    /// `Cancelled`.
    pub fn close(&self) {
        let state = std::mem::replace(&mut *self.inner.control.lock(), ControlState::Closed);
        if let ControlState::Open(sender) = state {
            sender.close();
        }
        if let Some(sender) = self.inner.binary.lock().take() {
            sender.close();
        }
    }
}
