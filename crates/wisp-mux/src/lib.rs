//! A library for running Wisp clients and servers.
//!
//! Wisp multiplexes many TCP and UDP streams over a single message transport,
//! usually a WebSocket. This crate contains the protocol engine for both roles:
//!
//! - [`packet`]: the byte-exact packet codec
//! - [`extensions`]: the extension sub-format carried by version 2 `INFO` packets
//! - [`flow`]: credit accounting and transport backpressure
//! - [`ClientMux`] / [`ServerMux`]: the per-connection multiplexers
//! - [`upstream`]: the access filter and socket adapter seams the server consumes
//! - [`ClientPool`]: caller-owned sharing of client connections by key
//!
//! Transports are plain `Stream<Item = Result<Bytes, WispError>>` read halves
//! and `Sink<Bytes, Error = WispError>` write halves, so any message-based
//! transport can carry Wisp.

pub mod extensions;
pub mod flow;
mod mux;
pub mod packet;
mod pool;
mod queue;
mod stream;
mod transport;
pub mod upstream;
#[cfg(feature = "tokio-websockets")]
pub mod ws;

use std::str::Utf8Error;

use thiserror::Error;

pub use mux::{ClientConfig, ClientMux, Negotiated, ServerConfig, ServerMux};
pub use pool::ClientPool;
pub use stream::{MuxStream, StreamState};
pub use transport::{TransportRead, TransportWrite};

/// Default number of `DATA` packets a server buffers per stream before it
/// applies backpressure.
pub const DEFAULT_BUFFER_SIZE: u32 = 128;

/// Default outbound transport depth, in bytes, above which the server stops
/// reading from upstream sockets.
pub const DEFAULT_HIGH_WATER: usize = 1024 * 1024;

/// Errors the Wisp protocol engine can return.
#[derive(Debug, Error)]
pub enum WispError {
    /// The frame was shorter than the fixed packet header.
    #[error("Packet too small: {0} bytes")]
    PacketTooSmall(usize),
    /// The frame's type byte matched no known packet type.
    #[error("Invalid packet type: {0:#04x}")]
    InvalidPacketType(u8),
    /// The payload was shorter than its packet type's minimum.
    #[error("Payload too small for {packet_type}: expected at least {expected} bytes, got {actual}")]
    PayloadTooSmall {
        packet_type: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A `CONNECT` hostname was not valid UTF-8.
    #[error("Invalid hostname: {0}")]
    InvalidHostname(#[source] Utf8Error),
    /// An extension payload could not be parsed.
    #[error("Invalid payload for extension {id:#04x}: {reason}")]
    InvalidExtension { id: u8, reason: &'static str },

    /// The peer sent something other than the expected handshake packet.
    #[error("Unexpected packet during handshake: {0}")]
    UnexpectedHandshakePacket(&'static str),
    /// The server requires password authentication and none was offered.
    #[error("Password authentication required")]
    PasswordAuthRequired,
    /// The offered credentials were rejected.
    #[error("Password authentication failed")]
    PasswordAuthFailed,
    /// UDP streams were requested but the UDP extension was not negotiated.
    #[error("UDP extension not negotiated")]
    UdpExtensionNotSupported,

    /// Every stream id is in use.
    #[error("No free stream ids")]
    StreamIdsExhausted,
    /// The stream was already closed.
    #[error("Stream already closed")]
    StreamAlreadyClosed,
    /// The multiplexor task has exited.
    #[error("Multiplexor closed")]
    MuxClosed,
    /// The transport closed.
    #[error("Transport closed")]
    TransportClosed,
    /// The transport implementation returned an error.
    #[error("Transport implementation error: {0}")]
    WsImplError(#[source] Box<dyn std::error::Error + Sync + Send>),
}

impl WispError {
    /// Whether this error concerns a single frame rather than the connection.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(
            self,
            Self::PacketTooSmall(_)
                | Self::InvalidPacketType(_)
                | Self::PayloadTooSmall { .. }
                | Self::InvalidHostname(_)
                | Self::InvalidExtension { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WispError>;
