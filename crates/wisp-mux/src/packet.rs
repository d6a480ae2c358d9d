//! Wisp packet codec.
//!
//! Every transport message carries exactly one packet:
//!
//! ```text
//! Frame    := type:u8 stream_id:u32le payload
//! Connect  := stream_type:u8 port:u16le hostname:utf8(remaining)
//! Data     := bytes(remaining)
//! Continue := buffer_remaining:u32le
//! Close    := reason:u8
//! Info     := major:u8 minor:u8 {ext_id:u8 ext_len:u32le ext_payload}*
//! ```
//!
//! Stream id 0 is reserved for connection-level control.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

use crate::extensions::{decode_tlv, encode_tlv, RawExtension};
use crate::WispError;

/// Size of the fixed `type + stream_id` header.
pub const PACKET_HEADER_SIZE: usize = 5;

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0x01,
    Data = 0x02,
    Continue = 0x03,
    Close = 0x04,
    Info = 0x05,
}

impl PacketType {
    /// Minimum payload length a packet of this type must carry.
    pub fn min_payload_size(self) -> usize {
        match self {
            Self::Connect => 3,
            Self::Data => 0,
            Self::Continue => 4,
            Self::Close => 1,
            Self::Info => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Data => "DATA",
            Self::Continue => "CONTINUE",
            Self::Close => "CLOSE",
            Self::Info => "INFO",
        }
    }
}

/// Type of a multiplexed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StreamType {
    Tcp = 0x01,
    Udp = 0x02,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Reason carried by a `CLOSE` packet.
///
/// The set is open: unrecognized codes decode to [`CloseReason::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CloseReason {
    /// Reason unspecified or unknown.
    Unknown = 0x01,
    /// Voluntary stream closure.
    Voluntary = 0x02,
    /// Unexpected stream closure due to a network error.
    Unexpected = 0x03,
    /// Stream creation failed due to invalid information.
    ServerStreamInvalidInfo = 0x41,
    /// Stream creation failed due to an unreachable destination host.
    ServerStreamUnreachable = 0x42,
    /// Stream creation timed out due to the destination server not responding.
    ServerStreamConnectionTimedOut = 0x43,
    /// Stream creation failed due to the destination server refusing the connection.
    ServerStreamConnectionRefused = 0x44,
    /// TCP data transfer timed out.
    ServerStreamTimedOut = 0x47,
    /// Stream destination address or port is blocked by the server.
    ServerStreamBlockedAddress = 0x48,
    /// The connection was throttled by the server.
    ServerStreamThrottled = 0x49,
    /// The client encountered an unexpected error.
    ClientUnexpected = 0x81,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Protocol version announced in an `INFO` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WispVersion {
    pub major: u8,
    pub minor: u8,
}

impl WispVersion {
    pub const V1: Self = Self { major: 1, minor: 0 };
    pub const V2: Self = Self { major: 2, minor: 0 };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub stream_type: StreamType,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuePacket {
    pub buffer_remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePacket {
    pub reason: CloseReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPacket {
    pub version: WispVersion,
    pub extensions: Vec<RawExtension>,
}

/// Packet payload, one variant per packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Connect(ConnectPacket),
    Data(Bytes),
    Continue(ContinuePacket),
    Close(ClosePacket),
    Info(InfoPacket),
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::Data(_) => PacketType::Data,
            Self::Continue(_) => PacketType::Continue,
            Self::Close(_) => PacketType::Close,
            Self::Info(_) => PacketType::Info,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Connect(connect) => 3 + connect.host.len(),
            Self::Data(data) => data.len(),
            Self::Continue(_) => 4,
            Self::Close(_) => 1,
            Self::Info(info) => {
                2 + info
                    .extensions
                    .iter()
                    .map(|ext| 5 + ext.payload.len())
                    .sum::<usize>()
            }
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Connect(connect) => {
                buf.put_u8(connect.stream_type.into());
                buf.put_u16_le(connect.port);
                buf.extend_from_slice(connect.host.as_bytes());
            }
            Self::Data(data) => buf.extend_from_slice(data),
            Self::Continue(cont) => buf.put_u32_le(cont.buffer_remaining),
            Self::Close(close) => buf.put_u8(close.reason.into()),
            Self::Info(info) => {
                buf.put_u8(info.version.major);
                buf.put_u8(info.version.minor);
                encode_tlv(&info.extensions, buf);
            }
        }
    }

    fn decode(packet_type: PacketType, mut bytes: Bytes) -> Result<Self, WispError> {
        if bytes.len() < packet_type.min_payload_size() {
            return Err(WispError::PayloadTooSmall {
                packet_type: packet_type.name(),
                expected: packet_type.min_payload_size(),
                actual: bytes.len(),
            });
        }

        Ok(match packet_type {
            PacketType::Connect => {
                let stream_type = StreamType::from(bytes.get_u8());
                let port = bytes.get_u16_le();
                let host = std::str::from_utf8(&bytes)
                    .map_err(WispError::InvalidHostname)?
                    .to_string();
                Self::Connect(ConnectPacket {
                    stream_type,
                    host,
                    port,
                })
            }
            PacketType::Data => Self::Data(bytes),
            PacketType::Continue => Self::Continue(ContinuePacket {
                buffer_remaining: bytes.get_u32_le(),
            }),
            PacketType::Close => Self::Close(ClosePacket {
                reason: CloseReason::from(bytes.get_u8()),
            }),
            PacketType::Info => {
                let major = bytes.get_u8();
                let minor = bytes.get_u8();
                Self::Info(InfoPacket {
                    version: WispVersion { major, minor },
                    extensions: decode_tlv(bytes),
                })
            }
        })
    }
}

/// A single Wisp packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_id: u32,
    pub payload: Payload,
}

impl Packet {
    pub fn new_connect(stream_id: u32, stream_type: StreamType, host: String, port: u16) -> Self {
        Self {
            stream_id,
            payload: Payload::Connect(ConnectPacket {
                stream_type,
                host,
                port,
            }),
        }
    }

    pub fn new_data(stream_id: u32, data: Bytes) -> Self {
        Self {
            stream_id,
            payload: Payload::Data(data),
        }
    }

    pub fn new_continue(stream_id: u32, buffer_remaining: u32) -> Self {
        Self {
            stream_id,
            payload: Payload::Continue(ContinuePacket { buffer_remaining }),
        }
    }

    pub fn new_close(stream_id: u32, reason: CloseReason) -> Self {
        Self {
            stream_id,
            payload: Payload::Close(ClosePacket { reason }),
        }
    }

    pub fn new_info(version: WispVersion, extensions: Vec<RawExtension>) -> Self {
        Self {
            stream_id: 0,
            payload: Payload::Info(InfoPacket {
                version,
                extensions,
            }),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.payload.packet_type()
    }

    /// Serialize into a single transport message.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.encoded_len());
        buf.put_u8(self.packet_type().into());
        buf.put_u32_le(self.stream_id);
        self.payload.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parse a transport message.
    pub fn decode(mut bytes: Bytes) -> Result<Self, WispError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(WispError::PacketTooSmall(bytes.len()));
        }
        let raw_type = bytes.get_u8();
        let stream_id = bytes.get_u32_le();
        let packet_type =
            PacketType::try_from(raw_type).map_err(|_| WispError::InvalidPacketType(raw_type))?;

        Ok(Self {
            stream_id,
            payload: Payload::decode(packet_type, bytes)?,
        })
    }
}

impl TryFrom<Bytes> for Packet {
    type Error = WispError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Self::decode(bytes)
    }
}

impl From<Packet> for Bytes {
    fn from(packet: Packet) -> Self {
        packet.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) {
        let decoded = Packet::decode(packet.encode()).expect("decode failed");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn connect_wire_layout() {
        let packet = Packet::new_connect(7, StreamType::Tcp, "example.com".into(), 80);
        let bytes = packet.encode();
        assert_eq!(&bytes[..8], &[0x01, 7, 0, 0, 0, 0x01, 80, 0]);
        assert_eq!(&bytes[8..], b"example.com");
    }

    #[test]
    fn continue_and_close_wire_layout() {
        let bytes = Packet::new_continue(0, 128).encode();
        assert_eq!(&bytes[..], &[0x03, 0, 0, 0, 0, 128, 0, 0, 0]);

        let bytes = Packet::new_close(0x0102_0304, CloseReason::ServerStreamBlockedAddress).encode();
        assert_eq!(&bytes[..], &[0x04, 0x04, 0x03, 0x02, 0x01, 0x48]);
    }

    #[test]
    fn round_trips_every_payload_kind() {
        let long_host: String = "a".repeat(255);
        for port in [0, 1, 80, 443, 65535] {
            round_trip(Packet::new_connect(1, StreamType::Tcp, long_host.clone(), port));
            round_trip(Packet::new_connect(u32::MAX, StreamType::Udp, "h".into(), port));
        }
        round_trip(Packet::new_connect(2, StreamType::Other(9), String::new(), 22));
        round_trip(Packet::new_data(3, Bytes::new()));
        round_trip(Packet::new_data(3, Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")));
        round_trip(Packet::new_continue(4, u32::MAX));
        for reason in 0..=u8::MAX {
            round_trip(Packet::new_close(5, CloseReason::from(reason)));
        }
        round_trip(Packet::new_info(
            WispVersion::V2,
            vec![
                RawExtension::new(0x01, Bytes::new()),
                RawExtension::new(0x04, Bytes::from_static(b"hello")),
            ],
        ));
    }

    #[test]
    fn rejects_short_frames() {
        let err = Packet::decode(Bytes::from_static(&[0x02, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, WispError::PacketTooSmall(4)));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = Packet::decode(Bytes::from_static(&[0x09, 1, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, WispError::InvalidPacketType(0x09)));
        assert!(err.is_malformed_frame());
    }

    #[test]
    fn rejects_short_payloads() {
        let cases: [(&[u8], &str); 4] = [
            (&[0x01, 1, 0, 0, 0, 0x01, 80], "CONNECT"),
            (&[0x03, 1, 0, 0, 0, 0, 0, 0], "CONTINUE"),
            (&[0x04, 1, 0, 0, 0], "CLOSE"),
            (&[0x05, 0, 0, 0, 0, 2], "INFO"),
        ];
        for (bytes, name) in cases {
            match Packet::decode(Bytes::from_static(bytes)) {
                Err(WispError::PayloadTooSmall { packet_type, .. }) => assert_eq!(packet_type, name),
                other => panic!("expected PayloadTooSmall for {name}, got {other:?}"),
            }
        }
    }

    #[test]
    fn empty_data_is_valid() {
        let packet = Packet::decode(Bytes::from_static(&[0x02, 9, 0, 0, 0])).unwrap();
        assert_eq!(packet, Packet::new_data(9, Bytes::new()));
    }

    #[test]
    fn rejects_non_utf8_hostname() {
        let err = Packet::decode(Bytes::from_static(&[0x01, 1, 0, 0, 0, 0x01, 80, 0, 0xff])).unwrap_err();
        assert!(matches!(err, WispError::InvalidHostname(_)));
    }

    #[test]
    fn info_truncates_overrunning_extension() {
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&[0x05, 0, 0, 0, 0, 2, 0]);
        raw.extend_from_slice(&[0x01, 0, 0, 0, 0]);
        // declares 10 bytes but carries 3
        raw.extend_from_slice(&[0x04, 10, 0, 0, 0, b'a', b'b', b'c']);

        let packet = Packet::decode(raw.freeze()).unwrap();
        let Payload::Info(info) = packet.payload else {
            panic!("expected INFO");
        };
        assert_eq!(info.version, WispVersion::V2);
        assert_eq!(info.extensions, vec![RawExtension::new(0x01, Bytes::new())]);
    }
}
