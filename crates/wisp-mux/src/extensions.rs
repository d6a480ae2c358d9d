//! Wisp version 2 protocol extensions.
//!
//! Extensions ride in the tail of an `INFO` packet as a tag-length-value list:
//! `[ext_id:u8][ext_len:u32le][payload]`. The same extension id carries a
//! different payload depending on which side sent it, so each role gets its
//! own type: a client parses [`ServerExtension`]s and a server parses
//! [`ClientExtension`]s.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Result, WispError};

/// Extensions this crate knows how to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ExtensionKind {
    /// UDP stream support.
    Udp = 0x01,
    /// Username and password authentication.
    PasswordAuth = 0x02,
    /// Message of the day.
    Motd = 0x04,
}

/// An extension as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExtension {
    pub id: u8,
    pub payload: Bytes,
}

impl RawExtension {
    pub fn new(id: u8, payload: Bytes) -> Self {
        Self { id, payload }
    }
}

/// Walk a TLV list. A trailing entry whose declared length overruns the
/// buffer ends the walk without error.
pub fn decode_tlv(mut buf: Bytes) -> Vec<RawExtension> {
    let mut extensions = Vec::new();
    while buf.remaining() >= 5 {
        let id = buf.get_u8();
        let len = buf.get_u32_le() as usize;
        if len > buf.remaining() {
            break;
        }
        extensions.push(RawExtension::new(id, buf.split_to(len)));
    }
    extensions
}

pub fn encode_tlv(extensions: &[RawExtension], buf: &mut BytesMut) {
    for ext in extensions {
        buf.put_u8(ext.id);
        buf.put_u32_le(ext.payload.len() as u32);
        buf.extend_from_slice(&ext.payload);
    }
}

/// Payload of the password extension as sent by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordServerPayload {
    pub required: bool,
}

/// Payload of the password extension as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordClientPayload {
    pub username: String,
    pub password: String,
}

impl PasswordClientPayload {
    /// Check the credentials fit their length prefixes: 255 bytes for the
    /// username, 65535 for the password.
    pub fn validate(&self) -> Result<()> {
        let reason = if self.username.len() > u8::MAX as usize {
            "username longer than 255 bytes"
        } else if self.password.len() > u16::MAX as usize {
            "password longer than 65535 bytes"
        } else {
            return Ok(());
        };
        Err(WispError::InvalidExtension {
            id: ExtensionKind::PasswordAuth.into(),
            reason,
        })
    }
}

/// Extension as advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerExtension {
    Udp,
    PasswordAuth(PasswordServerPayload),
    Motd(String),
    Unknown(RawExtension),
}

/// Extension as advertised by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientExtension {
    Udp,
    PasswordAuth(PasswordClientPayload),
    Motd,
    Unknown(RawExtension),
}

/// An extension payload for one side of the connection.
pub trait ExtensionPayload: Sized {
    /// Wire id.
    fn id(&self) -> u8;

    /// The known kind, or `None` for retained unknown extensions.
    fn kind(&self) -> Option<ExtensionKind> {
        ExtensionKind::try_from(self.id()).ok()
    }

    fn decode(kind: ExtensionKind, payload: Bytes) -> Result<Self>;

    fn encode(&self) -> Bytes;

    fn unknown(raw: RawExtension) -> Self;

    fn to_raw(&self) -> RawExtension {
        RawExtension::new(self.id(), self.encode())
    }
}

fn utf8(id: ExtensionKind, bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| WispError::InvalidExtension {
            id: id.into(),
            reason: "string is not valid UTF-8",
        })
}

impl ExtensionPayload for ServerExtension {
    fn id(&self) -> u8 {
        match self {
            Self::Udp => ExtensionKind::Udp.into(),
            Self::PasswordAuth(_) => ExtensionKind::PasswordAuth.into(),
            Self::Motd(_) => ExtensionKind::Motd.into(),
            Self::Unknown(raw) => raw.id,
        }
    }

    fn decode(kind: ExtensionKind, payload: Bytes) -> Result<Self> {
        match kind {
            ExtensionKind::Udp => Ok(Self::Udp),
            ExtensionKind::PasswordAuth => {
                let Some(&required) = payload.first() else {
                    return Err(WispError::InvalidExtension {
                        id: kind.into(),
                        reason: "missing required flag",
                    });
                };
                Ok(Self::PasswordAuth(PasswordServerPayload {
                    required: required != 0,
                }))
            }
            ExtensionKind::Motd => Ok(Self::Motd(utf8(kind, &payload)?)),
        }
    }

    fn encode(&self) -> Bytes {
        match self {
            Self::Udp => Bytes::new(),
            Self::PasswordAuth(payload) => Bytes::copy_from_slice(&[payload.required as u8]),
            Self::Motd(motd) => Bytes::copy_from_slice(motd.as_bytes()),
            Self::Unknown(raw) => raw.payload.clone(),
        }
    }

    fn unknown(raw: RawExtension) -> Self {
        Self::Unknown(raw)
    }
}

impl ExtensionPayload for ClientExtension {
    fn id(&self) -> u8 {
        match self {
            Self::Udp => ExtensionKind::Udp.into(),
            Self::PasswordAuth(_) => ExtensionKind::PasswordAuth.into(),
            Self::Motd => ExtensionKind::Motd.into(),
            Self::Unknown(raw) => raw.id,
        }
    }

    fn decode(kind: ExtensionKind, mut payload: Bytes) -> Result<Self> {
        match kind {
            ExtensionKind::Udp => Ok(Self::Udp),
            ExtensionKind::Motd => Ok(Self::Motd),
            ExtensionKind::PasswordAuth => {
                let invalid = |reason| WispError::InvalidExtension {
                    id: kind.into(),
                    reason,
                };
                if payload.remaining() < 3 {
                    return Err(invalid("missing credential lengths"));
                }
                let username_len = payload.get_u8() as usize;
                let password_len = payload.get_u16_le() as usize;
                if payload.remaining() < username_len + password_len {
                    return Err(invalid("credentials shorter than declared"));
                }
                let username = utf8(kind, &payload.split_to(username_len))?;
                let password = utf8(kind, &payload.split_to(password_len))?;
                Ok(Self::PasswordAuth(PasswordClientPayload { username, password }))
            }
        }
    }

    fn encode(&self) -> Bytes {
        match self {
            Self::Udp | Self::Motd => Bytes::new(),
            Self::PasswordAuth(creds) => {
                let mut buf =
                    BytesMut::with_capacity(3 + creds.username.len() + creds.password.len());
                buf.put_u8(creds.username.len() as u8);
                buf.put_u16_le(creds.password.len() as u16);
                buf.extend_from_slice(creds.username.as_bytes());
                buf.extend_from_slice(creds.password.as_bytes());
                buf.freeze()
            }
            Self::Unknown(raw) => raw.payload.clone(),
        }
    }

    fn unknown(raw: RawExtension) -> Self {
        Self::Unknown(raw)
    }
}

/// Interpret raw extensions, parsing the kinds in `known` and retaining
/// everything else as opaque [`RawExtension`]s.
pub fn parse_raw_extensions<E: ExtensionPayload>(
    raw: impl IntoIterator<Item = RawExtension>,
    known: &[ExtensionKind],
) -> Result<Vec<E>> {
    raw.into_iter()
        .map(|ext| match ExtensionKind::try_from(ext.id) {
            Ok(kind) if known.contains(&kind) => E::decode(kind, ext.payload),
            _ => Ok(E::unknown(ext)),
        })
        .collect()
}

/// Parse the TLV tail of an `INFO` payload.
pub fn parse_extensions<E: ExtensionPayload>(buf: Bytes, known: &[ExtensionKind]) -> Result<Vec<E>> {
    parse_raw_extensions(decode_tlv(buf), known)
}

/// Serialize extensions in the order given.
pub fn serialize_extensions<E: ExtensionPayload>(extensions: &[E]) -> Bytes {
    let raw: Vec<RawExtension> = extensions.iter().map(ExtensionPayload::to_raw).collect();
    let mut buf = BytesMut::new();
    encode_tlv(&raw, &mut buf);
    buf.freeze()
}

/// Every kind this crate understands.
pub const ALL_KINDS: &[ExtensionKind] = &[
    ExtensionKind::Udp,
    ExtensionKind::PasswordAuth,
    ExtensionKind::Motd,
];
