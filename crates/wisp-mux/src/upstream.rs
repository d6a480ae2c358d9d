//! Collaborators a [`ServerMux`](crate::ServerMux) consults when a client
//! asks for a new stream: an access filter deciding whether the destination
//! is allowed, and a connector opening the real socket.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::packet::{CloseReason, ConnectPacket};

/// Snapshot of the requesting connection, taken when `CONNECT` arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Live streams on the connection, not counting the new one.
    pub stream_count: usize,
    /// Live streams to the same hostname, not counting the new one.
    pub streams_to_host: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Connect to the given destination, which may differ from the request
    /// (e.g. a resolved address).
    Allow(ConnectPacket),
    /// Refuse the stream with this close reason.
    Deny(CloseReason),
}

#[async_trait]
pub trait AccessFilter: Send + Sync + 'static {
    /// `context` is `None` when there is no Wisp connection behind the
    /// request.
    async fn evaluate(
        &self,
        request: &ConnectPacket,
        context: Option<&ConnectionContext>,
    ) -> FilterVerdict;
}

/// Filter that allows every request unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessFilter for AllowAll {
    async fn evaluate(&self, request: &ConnectPacket, _: Option<&ConnectionContext>) -> FilterVerdict {
        FilterVerdict::Allow(request.clone())
    }
}

/// Read side of a destination socket.
#[async_trait]
pub trait SocketRead: Send {
    /// Next chunk, or `None` at end of stream.
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// Write side of a destination socket.
#[async_trait]
pub trait SocketWrite: Send {
    async fn send(&mut self, data: Bytes) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;
}

/// A connected destination socket, split so both directions can be pumped
/// concurrently.
pub struct ProxySocket {
    pub read: Box<dyn SocketRead>,
    pub write: Box<dyn SocketWrite>,
}

impl ProxySocket {
    pub fn new(read: impl SocketRead + 'static, write: impl SocketWrite + 'static) -> Self {
        Self {
            read: Box::new(read),
            write: Box::new(write),
        }
    }
}

#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    async fn connect(&self, destination: &ConnectPacket) -> io::Result<ProxySocket>;
}

/// Close reason reported to the client when connecting upstream fails.
pub fn close_reason_for_connect_error(err: &io::Error) -> CloseReason {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => CloseReason::ServerStreamConnectionRefused,
        io::ErrorKind::TimedOut => CloseReason::ServerStreamConnectionTimedOut,
        io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => {
            CloseReason::ServerStreamUnreachable
        }
        _ => CloseReason::Unexpected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::StreamType;

    #[tokio::test]
    async fn allow_all_passes_request_through() {
        let request = ConnectPacket {
            stream_type: StreamType::Udp,
            host: "example.com".into(),
            port: 53,
        };
        assert_eq!(
            AllowAll.evaluate(&request, None).await,
            FilterVerdict::Allow(request.clone())
        );
    }

    #[test]
    fn connect_errors_map_to_close_reasons() {
        let reason = |kind: io::ErrorKind| close_reason_for_connect_error(&kind.into());
        assert_eq!(
            reason(io::ErrorKind::ConnectionRefused),
            CloseReason::ServerStreamConnectionRefused
        );
        assert_eq!(
            reason(io::ErrorKind::TimedOut),
            CloseReason::ServerStreamConnectionTimedOut
        );
        assert_eq!(
            reason(io::ErrorKind::AddrNotAvailable),
            CloseReason::ServerStreamUnreachable
        );
        assert_eq!(reason(io::ErrorKind::BrokenPipe), CloseReason::Unexpected);
    }
}
