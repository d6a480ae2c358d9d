mod client;
mod server;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

pub use client::{ClientConfig, ClientMux};
pub use server::{ServerConfig, ServerMux};

use crate::{
    extensions::{ExtensionKind, ExtensionPayload},
    packet::{CloseReason, StreamType, WispVersion},
    queue::QueueSender,
    stream::StreamShared,
    Result,
};

/// Requests from stream handles and pumps to a connection's dispatch loop.
///
/// Everything that touches the stream table or credit goes through here, so
/// the dispatch loop is the only place either is mutated.
pub(crate) enum Command {
    /// Register a client stream and send its `CONNECT`. The loop picks the
    /// stream id and sends it back through `reply`.
    Open {
        stream_type: StreamType,
        host: String,
        port: u16,
        inbound: QueueSender,
        shared: Arc<StreamShared>,
        reply: oneshot::Sender<Result<u32>>,
    },
    /// Client payload for the destination, subject to credit.
    Data { id: u32, data: Bytes },
    /// Close a stream locally and tell the peer.
    Close { id: u32, reason: CloseReason },
    /// A server stream's destination socket connected.
    Opened { id: u32 },
    /// Tear the connection down.
    Shutdown,
}

/// Outcome of version negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated<E> {
    pub version: WispVersion,
    /// Extensions both sides agreed on, as sent by the peer.
    pub extensions: Vec<E>,
}

impl<E: ExtensionPayload> Negotiated<E> {
    pub(crate) fn v1() -> Self {
        Self {
            version: WispVersion::V1,
            extensions: Vec::new(),
        }
    }

    pub fn has(&self, kind: ExtensionKind) -> bool {
        self.extensions.iter().any(|ext| ext.kind() == Some(kind))
    }

    /// Version 1 connections always allow UDP; later versions only with
    /// the UDP extension.
    pub fn allows_udp(&self) -> bool {
        self.version.major < 2 || self.has(ExtensionKind::Udp)
    }
}
