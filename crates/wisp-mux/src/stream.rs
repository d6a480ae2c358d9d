use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use bytes::Bytes;

use crate::{
    mux::Command,
    packet::{CloseReason, StreamType},
    queue::QueueReceiver,
    Result, WispError,
};

/// Lifecycle of a multiplexed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// `CONNECT` exchanged, destination not yet connected.
    Pending,
    /// Data may flow.
    Open,
    /// Terminal.
    Closed,
}

/// State shared between a stream handle and its connection.
#[derive(Debug, Default)]
pub(crate) struct StreamShared {
    closed: AtomicBool,
    reason: OnceLock<CloseReason>,
}

impl StreamShared {
    /// Record the close. Returns `false` if the stream was already closed.
    pub fn mark_closed(&self, reason: CloseReason) -> bool {
        let _ = self.reason.set(reason);
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Client side of a multiplexed stream.
///
/// Dropping the handle closes the stream with [`CloseReason::Voluntary`].
pub struct MuxStream {
    id: u32,
    stream_type: StreamType,
    inbound: QueueReceiver,
    commands: flume::Sender<Command>,
    shared: Arc<StreamShared>,
}

impl MuxStream {
    pub(crate) fn new(
        id: u32,
        stream_type: StreamType,
        inbound: QueueReceiver,
        commands: flume::Sender<Command>,
        shared: Arc<StreamShared>,
    ) -> Self {
        Self {
            id,
            stream_type,
            inbound,
            commands,
            shared,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn state(&self) -> StreamState {
        if self.shared.is_closed() {
            StreamState::Closed
        } else {
            StreamState::Open
        }
    }

    /// Why the stream closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.get().copied()
    }

    /// Queue data for the destination. TCP data beyond the current credit is
    /// held by the connection until the server grants more.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.shared.is_closed() {
            return Err(WispError::StreamAlreadyClosed);
        }
        self.commands
            .send_async(Command::Data { id: self.id, data })
            .await
            .map_err(|_| WispError::MuxClosed)
    }

    /// Next chunk from the destination, or `None` once the stream closed.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inbound.get().await
    }

    /// Close the stream. Closing an already closed stream does nothing.
    pub async fn close(&self, reason: CloseReason) -> Result<()> {
        if !self.shared.mark_closed(reason) {
            return Ok(());
        }
        self.commands
            .send_async(Command::Close { id: self.id, reason })
            .await
            .map_err(|_| WispError::MuxClosed)
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if self.shared.mark_closed(CloseReason::Voluntary) {
            let _ = self.commands.send(Command::Close {
                id: self.id,
                reason: CloseReason::Voluntary,
            });
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("stream_type", &self.stream_type)
            .field("state", &self.state())
            .finish()
    }
}
